//! Expression engine: CEL programs compiled once, evaluated per action.
//!
//! Parsing and evaluation are handled by `cel-interpreter`. This module adds
//! the declaration check run at compile time and the conversion between the
//! JSON activation and CEL values.
//!
//! ```text
//! action == "transfer" ? "Transferred" : "Other"
//! [data.from, data.to]
//! db_ops.filter(d, d.table_name == "accounts").map(d, d.scope)
//! ```

use cel_interpreter::objects::{Key, Map};
use cel_interpreter::{Context, ExecutionError, Value as CelValue};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::activation::Activation;
use crate::error::{EvalError, ExprError};

// ─── Declarations ─────────────────────────────────────────────────────────────

const ACTION_VARS: &[&str] = &[
    "block_num",
    "block_id",
    "block_time",
    "step",
    "transaction_id",
    "status",
    "executed",
    "correlation",
    "receiver",
    "account",
    "action",
    "data",
    "auth",
    "first_auth_actor",
    "global_seq",
    "execution_index",
];

/// Functions and macros registered by the default CEL context.
const FUNCTIONS: &[&str] = &[
    "all",
    "contains",
    "double",
    "duration",
    "endsWith",
    "exists",
    "exists_one",
    "filter",
    "has",
    "int",
    "map",
    "matches",
    "max",
    "size",
    "startsWith",
    "string",
    "timestamp",
    "uint",
];

/// Macros whose first argument binds a loop variable.
const BINDING_MACROS: &[&str] = &["all", "exists", "exists_one", "filter", "map"];

/// The set of root identifiers an activation provides.
///
/// Referencing anything else is rejected at compile time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declarations {
    names: HashSet<&'static str>,
}

impl Declarations {
    /// Action fields plus the decoded row mutations (`db_ops`).
    pub fn generic() -> Self {
        Self::from_names(ACTION_VARS.iter().copied().chain(["db_ops"]))
    }

    /// Action-trace fields only.
    pub fn action() -> Self {
        Self::from_names(ACTION_VARS.iter().copied())
    }

    /// Generic declarations plus the single mutation in scope (`db_op`).
    pub fn table() -> Self {
        Self::from_names(ACTION_VARS.iter().copied().chain(["db_ops", "db_op"]))
    }

    pub fn from_names<I: IntoIterator<Item = &'static str>>(names: I) -> Self {
        Self {
            names: names.into_iter().collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}

// ─── Program ──────────────────────────────────────────────────────────────────

/// A compiled expression.
///
/// Immutable and cheap to clone; share it freely between tasks.
#[derive(Clone)]
pub struct Program {
    source: Arc<str>,
    inner: Arc<cel_interpreter::Program>,
    /// Root variables the program reads, bound from the activation on each run.
    variables: Arc<[String]>,
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program").field("source", &self.source).finish()
    }
}

impl Program {
    /// Parse `source` and check every reference against `decls`.
    pub fn compile(source: &str, decls: &Declarations) -> Result<Self, ExprError> {
        if source.trim().is_empty() {
            return Err(ExprError::Empty);
        }
        let inner = cel_interpreter::Program::compile(source)
            .map_err(|e| ExprError::Syntax(e.to_string()))?;

        let (variables, functions) = {
            let refs = inner.references();
            let variables: Vec<String> = refs.variables().into_iter().map(String::from).collect();
            let functions: Vec<String> = refs.functions().into_iter().map(String::from).collect();
            (variables, functions)
        };

        if let Some(name) = functions.iter().find(|f| !FUNCTIONS.contains(&f.as_str())) {
            return Err(ExprError::UnknownFunction { name: name.clone() });
        }
        let bound = loop_variables(source);
        let mut roots = Vec::with_capacity(variables.len());
        for name in variables {
            if decls.contains(&name) {
                roots.push(name);
            } else if !bound.contains(name.as_str()) {
                return Err(ExprError::Undeclared { name });
            }
        }

        Ok(Self {
            source: Arc::from(source),
            inner: Arc::new(inner),
            variables: roots.into(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate to a raw JSON value.
    pub fn eval(&self, activation: &Activation) -> Result<Value, EvalError> {
        from_cel(self.execute(activation)?)
    }

    /// Evaluate and require a string result.
    pub fn eval_string(&self, activation: &Activation) -> Result<String, EvalError> {
        match self.execute(activation)? {
            CelValue::String(s) => Ok(s.to_string()),
            other => Err(mismatch("string", &other)),
        }
    }

    /// Evaluate and require a list of strings (possibly empty).
    pub fn eval_string_array(&self, activation: &Activation) -> Result<Vec<String>, EvalError> {
        match self.execute(activation)? {
            CelValue::List(items) => items
                .iter()
                .map(|item| match item {
                    CelValue::String(s) => Ok(s.to_string()),
                    other => Err(EvalError::TypeMismatch {
                        expected: "list(string)".into(),
                        got: format!("list({})", type_name(other)),
                    }),
                })
                .collect(),
            other => Err(mismatch("list(string)", &other)),
        }
    }

    /// Evaluate and require a boolean result.
    pub fn eval_bool(&self, activation: &Activation) -> Result<bool, EvalError> {
        match self.execute(activation)? {
            CelValue::Bool(b) => Ok(b),
            other => Err(mismatch("bool", &other)),
        }
    }

    fn execute(&self, activation: &Activation) -> Result<CelValue, EvalError> {
        let mut context = Context::default();
        for name in self.variables.iter() {
            if let Some(value) = activation.resolve(name) {
                context.add_variable_from_value(name.as_str(), to_cel(value));
            }
        }
        Ok(self.inner.execute(&context)?)
    }
}

/// Identifiers bound by `list.map(x, ...)` style macros in `source`.
fn loop_variables(source: &str) -> HashSet<&str> {
    let mut bound = HashSet::new();
    for name in BINDING_MACROS {
        let call = format!(".{name}(");
        for (at, _) in source.match_indices(&call) {
            let rest = source[at + call.len()..].trim_start();
            let end = rest
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(rest.len());
            if end > 0 && rest[end..].trim_start().starts_with(',') {
                bound.insert(&rest[..end]);
            }
        }
    }
    bound
}

impl From<ExecutionError> for EvalError {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::NoSuchKey(key) => EvalError::NoSuchKey {
                key: key.to_string(),
            },
            ExecutionError::UndeclaredReference(name) => EvalError::Unbound {
                name: name.to_string(),
            },
            other => EvalError::Execution(other.to_string()),
        }
    }
}

// ─── JSON <-> CEL ─────────────────────────────────────────────────────────────

fn to_cel(value: &Value) -> CelValue {
    match value {
        Value::Null => CelValue::Null,
        Value::Bool(b) => CelValue::Bool(*b),
        Value::Number(n) => match (n.as_i64(), n.as_u64()) {
            (Some(i), _) => CelValue::Int(i),
            (None, Some(u)) => CelValue::UInt(u),
            _ => CelValue::Float(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => CelValue::String(Arc::new(s.clone())),
        Value::Array(items) => CelValue::List(Arc::new(items.iter().map(to_cel).collect())),
        Value::Object(fields) => CelValue::Map(Map {
            map: Arc::new(
                fields
                    .iter()
                    .map(|(k, v)| (Key::String(Arc::new(k.clone())), to_cel(v)))
                    .collect(),
            ),
        }),
    }
}

fn from_cel(value: CelValue) -> Result<Value, EvalError> {
    Ok(match value {
        CelValue::Null => Value::Null,
        CelValue::Bool(b) => Value::Bool(b),
        CelValue::Int(i) => Value::from(i),
        CelValue::UInt(u) => Value::from(u),
        CelValue::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        CelValue::String(s) => Value::String(s.to_string()),
        CelValue::List(items) => Value::Array(
            items
                .iter()
                .cloned()
                .map(from_cel)
                .collect::<Result<_, _>>()?,
        ),
        CelValue::Map(m) => Value::Object(
            m.map
                .iter()
                .map(|(k, v)| Ok((key_string(k), from_cel(v.clone())?)))
                .collect::<Result<_, EvalError>>()?,
        ),
        other => return Err(mismatch("JSON value", &other)),
    })
}

fn key_string(key: &Key) -> String {
    match key {
        Key::String(s) => s.to_string(),
        other => format!("{other:?}"),
    }
}

fn mismatch(expected: &str, got: &CelValue) -> EvalError {
    EvalError::TypeMismatch {
        expected: expected.into(),
        got: type_name(got).into(),
    }
}

fn type_name(value: &CelValue) -> &'static str {
    match value {
        CelValue::Null => "null",
        CelValue::Bool(_) => "bool",
        CelValue::Int(_) => "int",
        CelValue::UInt(_) => "uint",
        CelValue::Float(_) => "double",
        CelValue::String(_) => "string",
        CelValue::Bytes(_) => "bytes",
        CelValue::List(_) => "list",
        CelValue::Map(_) => "map",
        _ => "value",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn activation() -> Activation {
        Activation::from_pairs([
            ("action", json!("transfer")),
            ("account", json!("eosio.token")),
            ("block_num", json!(100)),
            ("data", json!({"from": "alice", "to": "bob", "quantity": "1.0000 EOS"})),
            ("auth", json!(["alice@active"])),
            (
                "db_ops",
                json!([
                    {"table_name": "stat", "new_json": {"supply": "10"}},
                    {"table_name": "accounts", "scope": "bob", "new_json": {"balance": "1.0000 EOS"}},
                    {"table_name": "accounts", "scope": "alice", "new_json": {"balance": "9.0000 EOS"}}
                ]),
            ),
        ])
    }

    fn run(src: &str) -> Result<Value, EvalError> {
        Program::compile(src, &Declarations::generic())
            .unwrap()
            .eval(&activation())
    }

    #[test]
    fn concatenation_and_ternary() {
        assert_eq!(run(r#"account + "::" + action"#).unwrap(), json!("eosio.token::transfer"));
        assert_eq!(
            run(r#"action == "transfer" ? "Transferred" : "Other""#).unwrap(),
            json!("Transferred")
        );
        assert_eq!(run(r#""blk-" + string(block_num + 1)"#).unwrap(), json!("blk-101"));
    }

    #[test]
    fn field_access_and_lists() {
        assert_eq!(run("[data.from, data.to]").unwrap(), json!(["alice", "bob"]));
        assert_eq!(run("data['to']").unwrap(), json!("bob"));
        assert_eq!(run("auth[0].startsWith('alice')").unwrap(), json!(true));
        assert_eq!(run("'bob' in [data.from, data.to]").unwrap(), json!(true));
        assert_eq!(run("has(data.memo)").unwrap(), json!(false));
    }

    #[test]
    fn macros_over_db_ops() {
        assert_eq!(
            run("db_ops.filter(d, d.table_name == 'accounts').map(d, d.scope)").unwrap(),
            json!(["bob", "alice"])
        );
        assert_eq!(run("db_ops.exists(d, d.table_name == 'nope')").unwrap(), json!(false));
        assert_eq!(run("db_ops.all(d, has(d.new_json))").unwrap(), json!(true));
        assert_eq!(run("size(db_ops.filter(x, x.table_name == 'stat'))").unwrap(), json!(1));
    }

    #[test]
    fn typed_results() {
        let a = activation();
        let decls = Declarations::generic();
        let p = Program::compile("[data.from, data.from, data.to]", &decls).unwrap();
        assert_eq!(p.eval_string_array(&a).unwrap(), vec!["alice", "alice", "bob"]);
        let p = Program::compile("[]", &decls).unwrap();
        assert!(p.eval_string_array(&a).unwrap().is_empty());
        let p = Program::compile("data.to", &decls).unwrap();
        assert!(matches!(p.eval_string_array(&a), Err(EvalError::TypeMismatch { .. })));
        let p = Program::compile("[data.to, block_num]", &decls).unwrap();
        assert_eq!(
            p.eval_string_array(&a).unwrap_err(),
            EvalError::TypeMismatch {
                expected: "list(string)".into(),
                got: "list(int)".into()
            }
        );
        let p = Program::compile("block_num", &decls).unwrap();
        assert!(matches!(p.eval_string(&a), Err(EvalError::TypeMismatch { .. })));
        let p = Program::compile("block_num > 99 && action != ''", &decls).unwrap();
        assert!(p.eval_bool(&a).unwrap());
        let p = Program::compile("action", &decls).unwrap();
        assert!(matches!(p.eval_bool(&a), Err(EvalError::TypeMismatch { .. })));
    }

    #[test]
    fn runtime_errors() {
        assert!(matches!(run("data.memo"), Err(EvalError::NoSuchKey { .. })));
        assert!(matches!(run("auth[3]"), Err(EvalError::Execution(_))));
        // declared but absent from this activation
        assert!(matches!(run("receiver"), Err(EvalError::Unbound { .. })));
    }

    #[test]
    fn deeply_nested_source_is_handled_by_the_parser() {
        let nested = format!("{}1{}", "(".repeat(64), ")".repeat(64));
        let p = Program::compile(&nested, &Declarations::generic()).unwrap();
        assert_eq!(p.eval(&activation()).unwrap(), json!(1));
        assert!(matches!(
            Program::compile("(data.to", &Declarations::generic()),
            Err(ExprError::Syntax(_))
        ));
        assert_eq!(
            Program::compile("  ", &Declarations::generic()).unwrap_err(),
            ExprError::Empty
        );
    }

    #[test]
    fn declarations_are_enforced() {
        assert_eq!(
            Program::compile("size(db_ops)", &Declarations::action()).unwrap_err(),
            ExprError::Undeclared {
                name: "db_ops".into()
            }
        );
        assert!(Program::compile("db_op.scope", &Declarations::generic()).is_err());
        assert!(Program::compile("db_op.scope", &Declarations::table()).is_ok());
        assert!(Program::compile("db_ops.map(d, d.scope)", &Declarations::generic()).is_ok());
        assert!(Program::compile("[d]", &Declarations::generic()).is_err());
        assert_eq!(
            Program::compile("sha(data)", &Declarations::generic()).unwrap_err(),
            ExprError::UnknownFunction { name: "sha".into() }
        );
    }

    #[test]
    fn loop_variables_are_found_per_macro() {
        let bound = loop_variables("db_ops.map(d, d.scope) + db_ops.filter( row , row.x).map(r,r)");
        assert_eq!(bound, HashSet::from(["d", "row", "r"]));
        assert!(loop_variables("size(db_ops)").is_empty());
    }
}
