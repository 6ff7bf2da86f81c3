use serde_json::Value;
use sqlx::postgres::{PgArguments, PgConnection};
use sqlx::query::Query;
use sqlx::Postgres;

use crate::error::{PgEngineError, Result};

/// Execute an SQL task body on `conn`.
///
/// With no parameter values the script runs once through the simple query
/// protocol, so multi-statement bodies work. Otherwise every non-empty value
/// is a JSON array bound positionally, and the script runs once per value.
/// Empty scripts are rejected before anything is sent to the server.
pub async fn execute_sql_command(
    conn: &mut PgConnection,
    script: &str,
    param_values: &[String],
) -> Result<()> {
    validate_script(script)?;

    if param_values.is_empty() {
        sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(script)).await?;
        return Ok(());
    }

    for (index, value) in param_values.iter().enumerate() {
        let Some(args) = parse_parameter_set(index, value)? else {
            continue;
        };
        let query = args
            .into_iter()
            .fold(sqlx::query(script), bind_json_value);
        sqlx::Executor::execute(&mut *conn, query).await?;
    }
    Ok(())
}

/// Reject task bodies that contain nothing to execute.
pub fn validate_script(script: &str) -> Result<()> {
    if script.trim().is_empty() {
        return Err(PgEngineError::EmptyScript);
    }
    Ok(())
}

/// Decode one parameter value into positional arguments.
///
/// An empty value means "no execution for this slot" and yields `None`.
pub fn parse_parameter_set(index: usize, value: &str) -> Result<Option<Vec<Value>>> {
    if value.trim().is_empty() {
        return Ok(None);
    }
    match serde_json::from_str::<Value>(value) {
        Ok(Value::Array(args)) => Ok(Some(args)),
        Ok(other) => Err(PgEngineError::InvalidParameter {
            index,
            reason: format!("expected a JSON array, got {other}"),
        }),
        Err(e) => Err(PgEngineError::InvalidParameter {
            index,
            reason: e.to_string(),
        }),
    }
}

fn bind_json_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s),
        nested @ (Value::Array(_) | Value::Object(_)) => query.bind(sqlx::types::Json(nested)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_scripts_fail_validation() {
        assert!(matches!(validate_script(""), Err(PgEngineError::EmptyScript)));
        assert!(matches!(validate_script(" \t\n"), Err(PgEngineError::EmptyScript)));
        assert!(validate_script(";").is_ok());
    }

    #[test]
    fn empty_value_is_skipped() {
        assert!(parse_parameter_set(0, "").unwrap().is_none());
        assert!(parse_parameter_set(0, "  ").unwrap().is_none());
    }

    #[test]
    fn array_values_become_positional_arguments() {
        let args = parse_parameter_set(0, r#"[42, "hey", null]"#)
            .unwrap()
            .unwrap();
        assert_eq!(args.len(), 3);
        assert_eq!(args[0], Value::from(42));
        assert_eq!(args[1], Value::from("hey"));
    }

    #[test]
    fn non_array_json_is_rejected_with_its_index() {
        let err = parse_parameter_set(2, r#"{"a": 1}"#).unwrap_err();
        assert!(matches!(err, PgEngineError::InvalidParameter { index: 2, .. }));
        assert!(err.is_validation());
    }

    #[test]
    fn invalid_json_is_rejected() {
        assert!(parse_parameter_set(0, "[1, ").is_err());
    }
}
