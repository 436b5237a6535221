//! Expression evaluation
//!
//! Loop conditions, completion conditions, cardinalities, actors, call
//! targets and operations are all expressions evaluated against an
//! [`EvaluationContext`].

use serde_json::{Map, Value};

use crate::domain::process_definition::{Expression, ExpressionLanguage};
use crate::types::{DataPacket, Variables};
use crate::{CoreError, CoreResult};

/// Reserved variable: index of the current iteration
pub const LOOP_COUNTER: &str = "loopCounter";
/// Reserved variable: total multi-instance children
pub const NUMBER_OF_INSTANCES: &str = "numberOfInstances";
/// Reserved variable: running multi-instance children
pub const NUMBER_OF_ACTIVE_INSTANCES: &str = "numberOfActiveInstances";
/// Reserved variable: completed multi-instance children
pub const NUMBER_OF_COMPLETED_INSTANCES: &str = "numberOfCompletedInstances";
/// Reserved variable: aborted or cancelled multi-instance children
pub const NUMBER_OF_TERMINATED_INSTANCES: &str = "numberOfTerminatedInstances";

/// Named variables visible to an expression, plus the container it runs for
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationContext {
    variables: Map<String, Value>,

    /// Id of the process or flow node instance the expression is evaluated for
    pub container_id: Option<String>,
}

impl EvaluationContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the container id
    pub fn for_container<S: Into<String>>(mut self, container_id: S) -> Self {
        self.container_id = Some(container_id.into());
        self
    }

    /// Add variables; later layers shadow earlier ones
    pub fn with_variables(mut self, variables: &Variables) -> Self {
        for (name, value) in variables {
            self.variables.insert(name.clone(), value.as_value().clone());
        }
        self
    }

    /// Add a single variable
    pub fn with_variable<S: Into<String>>(mut self, name: S, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    /// Look up a variable
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// The context as a JSON object
    pub fn as_json(&self) -> Value {
        Value::Object(self.variables.clone())
    }
}

/// Evaluates expressions
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluate an expression
    fn evaluate(&self, expression: &Expression, context: &EvaluationContext) -> CoreResult<DataPacket>;

    /// Evaluate an expression that must produce a boolean
    fn evaluate_condition(
        &self,
        expression: &Expression,
        context: &EvaluationContext,
    ) -> CoreResult<bool> {
        let result = self.evaluate(expression, context)?;
        result.as_bool().ok_or_else(|| {
            CoreError::Expression(format!(
                "Condition '{}' evaluated to {} instead of a boolean",
                expression.content, result.value
            ))
        })
    }
}

/// Evaluator for JMESPath and constant expressions
#[derive(Debug, Default, Clone, Copy)]
pub struct JmesPathEvaluator;

impl ExpressionEvaluator for JmesPathEvaluator {
    fn evaluate(&self, expression: &Expression, context: &EvaluationContext) -> CoreResult<DataPacket> {
        match expression.language {
            ExpressionLanguage::Constant => {
                let value: Value = serde_json::from_str(&expression.content)?;
                Ok(DataPacket::new(value))
            }
            ExpressionLanguage::JmesPath => {
                let compiled = jmespath::compile(&expression.content)?;
                let data = context.as_json();
                let result = compiled.search(&data)?;
                let value = serde_json::to_value(&*result)?;
                Ok(DataPacket::new(value))
            }
        }
    }
}
