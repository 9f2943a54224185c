//! Declarative assertions over collector results.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssertionOperator {
    Equals,
    NotEquals,
    Contains,
    Matches,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Exists,
}

/// `field operator value`, where `field` is a dotted path into the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assertion {
    pub field: String,
    pub operator: AssertionOperator,
    #[serde(default)]
    pub value: Value,
}

/// Why an assertion did not hold.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionFailure {
    pub field: String,
    pub operator: AssertionOperator,
    pub expected: Value,
    pub actual: Option<Value>,
    pub message: String,
}

/// Evaluate assertions in order and return the first failure.
pub fn evaluate_assertions(assertions: &[Assertion], result: &Value) -> Option<AssertionFailure> {
    assertions.iter().find_map(|a| check_assertion(a, result).err())
}

fn check_assertion(assertion: &Assertion, result: &Value) -> Result<(), AssertionFailure> {
    let actual = lookup(result, &assertion.field);
    let fail = |message: String| AssertionFailure {
        field: assertion.field.clone(),
        operator: assertion.operator,
        expected: assertion.value.clone(),
        actual: actual.cloned(),
        message,
    };

    let Some(actual_value) = actual else {
        return Err(fail(format!("field {} is missing", assertion.field)));
    };

    let holds = match assertion.operator {
        AssertionOperator::Exists => !actual_value.is_null(),
        AssertionOperator::Equals => values_equal(actual_value, &assertion.value),
        AssertionOperator::NotEquals => !values_equal(actual_value, &assertion.value),
        AssertionOperator::Contains => match (actual_value, &assertion.value) {
            (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
            (Value::Array(items), needle) => items.iter().any(|i| values_equal(i, needle)),
            _ => false,
        },
        AssertionOperator::Matches => {
            let (Value::String(s), Value::String(pattern)) = (actual_value, &assertion.value) else {
                return Err(fail("matches requires a string field and a string pattern".to_string()));
            };
            let re = Regex::new(pattern).map_err(|e| fail(format!("invalid pattern: {}", e)))?;
            re.is_match(s)
        }
        AssertionOperator::LessThan
        | AssertionOperator::LessThanOrEqual
        | AssertionOperator::GreaterThan
        | AssertionOperator::GreaterThanOrEqual => {
            let (Some(a), Some(b)) = (actual_value.as_f64(), assertion.value.as_f64()) else {
                return Err(fail("numeric comparison requires numbers".to_string()));
            };
            match assertion.operator {
                AssertionOperator::LessThan => a < b,
                AssertionOperator::LessThanOrEqual => a <= b,
                AssertionOperator::GreaterThan => a > b,
                _ => a >= b,
            }
        }
    };

    if holds {
        Ok(())
    } else {
        Err(fail(format!(
            "expected {} {:?} {}, got {}",
            assertion.field, assertion.operator, assertion.value, actual_value
        )))
    }
}

/// Numbers compare by value so `200` equals `200.0`.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}
