//! CDC generator keyed by action name.

use async_trait::async_trait;
use std::collections::HashMap;

use super::{ActionScope, CdcGenerator, Generated};
use crate::activation::Activation;
use crate::error::{AdaptError, ConfigError};
use crate::expr::{Declarations, Program};

/// Emits one event per matched action whose name has a key expression.
#[derive(Debug, Clone, Default)]
pub struct ActionGenerator {
    key_extractors: HashMap<String, Program>,
}

impl ActionGenerator {
    pub fn new(key_extractors: HashMap<String, Program>) -> Self {
        Self { key_extractors }
    }

    /// Parse `{"<action>": "<key expression>", ...}` and compile every entry.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let map: HashMap<String, String> =
            serde_json::from_str(raw).map_err(|e| ConfigError::Invalid {
                name: "actions-expr".into(),
                reason: e.to_string(),
            })?;
        if map.is_empty() {
            return Err(ConfigError::Invalid {
                name: "actions-expr".into(),
                reason: "no action configured".into(),
            });
        }
        let decls = Declarations::action();
        let mut key_extractors = HashMap::with_capacity(map.len());
        for (action, source) in map {
            let program =
                Program::compile(&source, &decls).map_err(|source| ConfigError::Expression {
                    role: format!("key for action '{action}'"),
                    source,
                })?;
            key_extractors.insert(action, program);
        }
        Ok(Self { key_extractors })
    }

    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.key_extractors.keys().map(String::as_str)
    }
}

#[async_trait]
impl CdcGenerator for ActionGenerator {
    async fn generate(&self, scope: &ActionScope<'_>) -> Result<Vec<Generated>, AdaptError> {
        let Some(program) = self.key_extractors.get(&scope.act.name) else {
            return Ok(Vec::new());
        };
        let activation = Activation::new(
            scope.block,
            scope.step,
            scope.trx,
            scope.act,
            &[],
            scope.correlation,
        )?;
        let key = program
            .eval_string(&activation)
            .map_err(|e| AdaptError::eval(format!("key for action '{}'", scope.act.name), e))?;
        Ok(vec![Generated {
            key,
            event_type: scope.act.name.clone(),
            db_ops: Vec::new(),
            mutation: None,
        }])
    }
}
