use async_trait::async_trait;
use std::sync::Arc;

use super::StageHandler;
use crate::core::errors::{WorkerError, WorkerResult};
use crate::core::types::{Stage, TranslationPayload};
use crate::services::cache::Fingerprint;
use crate::services::translation::Translator;

/// Translation stage: block texts in, one translation per text out
pub struct TranslationHandler {
    translator: Arc<dyn Translator>,
}

impl TranslationHandler {
    pub fn new(translator: Arc<dyn Translator>) -> Self {
        Self { translator }
    }
}

#[async_trait]
impl StageHandler for TranslationHandler {
    type Payload = TranslationPayload;
    type Input = Vec<String>;
    type Output = Vec<String>;

    fn stage(&self) -> Stage {
        Stage::Translation
    }

    fn prepare(&self, payload: TranslationPayload) -> WorkerResult<Vec<String>> {
        Ok(payload.texts)
    }

    async fn fingerprint(&self, input: &Vec<String>) -> WorkerResult<Fingerprint> {
        Ok(Fingerprint::of_texts(input))
    }

    async fn process(&self, input: &Vec<String>) -> WorkerResult<Vec<String>> {
        let translations = self.translator.translate(input).await?;
        if translations.len() != input.len() {
            return Err(WorkerError::ContractViolation(format!(
                "{} texts but {} translations",
                input.len(),
                translations.len()
            )));
        }
        Ok(translations)
    }
}
