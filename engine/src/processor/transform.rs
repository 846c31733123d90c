//! Transform processor
//!
//! Renders a `{{var}}` template against the message and stores the result
//! as the new `body`; every other field is preserved. Missing variables
//! render as empty strings unless the placeholder says `|required`, which
//! raises a processing error instead.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use virta_core::{keys, Message, Result, RouteError};

use super::Processor;
use crate::template::{self, OnMissing};

/// Template-rendering transform
#[derive(Debug)]
pub struct Transform {
    template: String,
}

impl Transform {
    /// Validate the template syntax; failures are configuration errors
    pub fn new(template: &str) -> Result<Self> {
        template::validate(template)
            .map_err(|e| RouteError::Config(format!("transform template: {e}")))?;
        Ok(Self {
            template: template.to_string(),
        })
    }
}

#[async_trait]
impl Processor for Transform {
    fn name(&self) -> &str {
        "transform"
    }

    async fn process(&self, msg: Message, _cancel: &CancellationToken) -> Result<Option<Message>> {
        let rendered = template::render(&self.template, &msg, OnMissing::Empty)
            .map_err(|e| RouteError::processing("transform", e.to_string()))?;
        Ok(Some(msg.with_field(keys::BODY, rendered)))
    }
}
