//! Function library
//!
//! Functions are invoked by case-folded (uppercase) name with already
//! evaluated arguments. Arity and kind mismatches fail with `TypeMismatch`;
//! each function's null policy is documented on its arm.
//!
//! `IF` is not here: its unchosen branch must stay unevaluated, so the
//! evaluator special-cases it before argument evaluation.

use chrono::{DateTime, Datelike, Duration, FixedOffset, Months, SecondsFormat, Timelike, Utc};
use trellis_core::{ExpressionError, Value};

/// Invoke a library function. `name` must already be uppercase.
pub fn invoke(name: &str, args: &[Option<Value>]) -> Result<Option<Value>, ExpressionError> {
    match name {
        "SUM" => aggregate(name, args, |nums| nums.iter().sum()),
        "AVG" => aggregate(name, args, |nums| {
            nums.iter().sum::<f64>() / nums.len() as f64
        }),
        "MIN" => aggregate(name, args, |nums| {
            nums.iter().copied().fold(f64::INFINITY, f64::min)
        }),
        "MAX" => aggregate(name, args, |nums| {
            nums.iter().copied().fold(f64::NEG_INFINITY, f64::max)
        }),
        "COUNT" => {
            arity(name, args, 1)?;
            // Null list counts as null; list elements are non-null by
            // construction (absent values are dropped during traversal).
            match &args[0] {
                None => Ok(None),
                Some(v) => {
                    let items = expect_list(name, v)?;
                    Ok(Some(Value::number(items.len() as f64)))
                }
            }
        }
        "COALESCE" => {
            at_least(name, args, 1)?;
            Ok(args.iter().find_map(|a| a.clone()))
        }
        "CONCAT" => {
            at_least(name, args, 1)?;
            let mut out = String::new();
            for arg in args {
                match arg {
                    Some(v) => out.push_str(&v.display_text()),
                    None => out.push_str("null"),
                }
            }
            Ok(Some(Value::text(out)))
        }
        "UPPER" => text_unary(name, args, |s| s.to_uppercase()),
        "LOWER" => text_unary(name, args, |s| s.to_lowercase()),
        "TRIM" => text_unary(name, args, |s| s.trim().to_string()),
        "LENGTH" => {
            arity(name, args, 1)?;
            match &args[0] {
                None => Ok(None),
                Some(Value::Text { value }) => {
                    Ok(Some(Value::number(value.chars().count() as f64)))
                }
                Some(Value::List { items, .. }) => {
                    Ok(Some(Value::number(items.len() as f64)))
                }
                Some(other) => Err(mismatch(name, "text or list", other)),
            }
        }
        "SUBSTRING" => {
            arity(name, args, 3)?;
            let text = match opt_text(name, args, 0)? {
                Some(t) => t,
                None => return Ok(None),
            };
            let start = match opt_number(name, args, 1)? {
                Some(n) => n,
                None => return Ok(None),
            };
            let len = match opt_number(name, args, 2)? {
                Some(n) => n,
                None => return Ok(None),
            };
            let chars: Vec<char> = text.chars().collect();
            let start = start.max(0.0) as usize;
            let len = len.max(0.0) as usize;
            let slice: String = chars.iter().skip(start).take(len).collect();
            Ok(Some(Value::text(slice)))
        }
        "ROUND" => {
            if args.len() != 1 && args.len() != 2 {
                return Err(bad_arity(name, "1 or 2", args.len()));
            }
            let x = match opt_number(name, args, 0)? {
                Some(n) => n,
                None => return Ok(None),
            };
            let decimals = if args.len() == 2 {
                match opt_number(name, args, 1)? {
                    Some(n) => n as i32,
                    None => return Ok(None),
                }
            } else {
                0
            };
            let factor = 10f64.powi(decimals);
            Ok(Some(Value::number((x * factor).round_ties_even() / factor)))
        }
        "FLOOR" => number_unary(name, args, f64::floor),
        "CEIL" => number_unary(name, args, f64::ceil),
        "ABS" => number_unary(name, args, f64::abs),
        "SQRT" => {
            arity(name, args, 1)?;
            match opt_number(name, args, 0)? {
                None => Ok(None),
                Some(n) if n < 0.0 => Err(ExpressionError::DomainError {
                    function: "SQRT".to_string(),
                    reason: format!("square root of negative number {}", n),
                }),
                Some(n) => Ok(Some(Value::number(n.sqrt()))),
            }
        }
        "POW" => {
            arity(name, args, 2)?;
            match (opt_number(name, args, 0)?, opt_number(name, args, 1)?) {
                (Some(base), Some(exp)) => Ok(Some(Value::number(base.powf(exp)))),
                _ => Ok(None),
            }
        }
        "NOW" => {
            arity(name, args, 0)?;
            Ok(Some(Value::datetime(
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            )))
        }
        "DATE_DIFF" => {
            arity(name, args, 3)?;
            let (a, b, unit) = match (
                opt_datetime(name, args, 0)?,
                opt_datetime(name, args, 1)?,
                opt_text(name, args, 2)?,
            ) {
                (Some(a), Some(b), Some(unit)) => (a, b, unit),
                _ => return Ok(None),
            };
            let diff = date_diff(a, b, &unit)
                .ok_or_else(|| mismatch_str(name, "a valid time unit", &unit))?;
            Ok(Some(Value::number(diff as f64)))
        }
        "DATE_ADD" => {
            arity(name, args, 3)?;
            let (d, amount, unit) = match (
                opt_datetime(name, args, 0)?,
                opt_number(name, args, 1)?,
                opt_text(name, args, 2)?,
            ) {
                (Some(d), Some(amount), Some(unit)) => (d, amount, unit),
                _ => return Ok(None),
            };
            let added = date_add(d, amount as i64, &unit)
                .ok_or_else(|| mismatch_str(name, "a valid time unit", &unit))?;
            Ok(Some(Value::datetime(
                added.to_rfc3339_opts(SecondsFormat::Millis, false),
            )))
        }
        _ => Err(ExpressionError::UnknownFunction {
            name: name.to_string(),
        }),
    }
}

// ============================================================================
// AGGREGATES
// ============================================================================

/// Shared shape of SUM/AVG/MIN/MAX: one list-of-numbers argument; a null
/// list or an empty list yields null.
fn aggregate(
    name: &str,
    args: &[Option<Value>],
    fold: impl Fn(&[f64]) -> f64,
) -> Result<Option<Value>, ExpressionError> {
    arity(name, args, 1)?;
    let value = match &args[0] {
        None => return Ok(None),
        Some(v) => v,
    };
    let items = expect_list(name, value)?;
    let mut nums = Vec::with_capacity(items.len());
    for item in items {
        match item.as_number() {
            Some(n) => nums.push(n),
            None => return Err(mismatch(name, "a list of numbers", item)),
        }
    }
    if nums.is_empty() {
        return Ok(None);
    }
    Ok(Some(Value::number(fold(&nums))))
}

// ============================================================================
// DATE ARITHMETIC
// ============================================================================

fn date_diff(a: DateTime<FixedOffset>, b: DateTime<FixedOffset>, unit: &str) -> Option<i64> {
    let span = a.signed_duration_since(b);
    match unit.to_ascii_lowercase().as_str() {
        "seconds" => Some(span.num_seconds()),
        "minutes" => Some(span.num_minutes()),
        "hours" => Some(span.num_hours()),
        "days" => Some(span.num_days()),
        "months" => Some(month_diff(a, b)),
        "years" => Some(month_diff(a, b) / 12),
        _ => None,
    }
}

/// Whole calendar months between two datetimes, truncated toward zero.
fn month_diff(a: DateTime<FixedOffset>, b: DateTime<FixedOffset>) -> i64 {
    let raw = (a.year() as i64 * 12 + a.month0() as i64)
        - (b.year() as i64 * 12 + b.month0() as i64);
    let a_rest = (a.day(), a.hour(), a.minute(), a.second());
    let b_rest = (b.day(), b.hour(), b.minute(), b.second());
    if raw > 0 && a_rest < b_rest {
        raw - 1
    } else if raw < 0 && a_rest > b_rest {
        raw + 1
    } else {
        raw
    }
}

fn date_add(
    d: DateTime<FixedOffset>,
    amount: i64,
    unit: &str,
) -> Option<DateTime<FixedOffset>> {
    match unit.to_ascii_lowercase().as_str() {
        "seconds" => d.checked_add_signed(Duration::seconds(amount)),
        "minutes" => d.checked_add_signed(Duration::minutes(amount)),
        "hours" => d.checked_add_signed(Duration::hours(amount)),
        "days" => d.checked_add_signed(Duration::days(amount)),
        "months" => add_months(d, amount),
        "years" => add_months(d, amount.checked_mul(12)?),
        _ => None,
    }
}

fn add_months(d: DateTime<FixedOffset>, months: i64) -> Option<DateTime<FixedOffset>> {
    let magnitude = u32::try_from(months.unsigned_abs()).ok()?;
    if months >= 0 {
        d.checked_add_months(Months::new(magnitude))
    } else {
        d.checked_sub_months(Months::new(magnitude))
    }
}

// ============================================================================
// ARGUMENT HELPERS
// ============================================================================

fn arity(name: &str, args: &[Option<Value>], expected: usize) -> Result<(), ExpressionError> {
    if args.len() != expected {
        return Err(bad_arity(name, &expected.to_string(), args.len()));
    }
    Ok(())
}

fn at_least(name: &str, args: &[Option<Value>], min: usize) -> Result<(), ExpressionError> {
    if args.len() < min {
        return Err(bad_arity(name, &format!("at least {}", min), args.len()));
    }
    Ok(())
}

fn bad_arity(name: &str, expected: &str, got: usize) -> ExpressionError {
    ExpressionError::TypeMismatch {
        expected: format!("{} argument(s) to {}", expected, name),
        found: format!("{} argument(s)", got),
    }
}

fn mismatch(name: &str, expected: &str, found: &Value) -> ExpressionError {
    ExpressionError::TypeMismatch {
        expected: format!("{} for {}", expected, name),
        found: found.kind().to_string(),
    }
}

fn mismatch_str(name: &str, expected: &str, found: &str) -> ExpressionError {
    ExpressionError::TypeMismatch {
        expected: format!("{} for {}", expected, name),
        found: found.to_string(),
    }
}

fn expect_list<'a>(name: &str, value: &'a Value) -> Result<&'a [Value], ExpressionError> {
    value.as_list().ok_or_else(|| mismatch(name, "a list", value))
}

fn opt_number(
    name: &str,
    args: &[Option<Value>],
    i: usize,
) -> Result<Option<f64>, ExpressionError> {
    match &args[i] {
        None => Ok(None),
        Some(v) => v
            .as_number()
            .map(Some)
            .ok_or_else(|| mismatch(name, "a number", v)),
    }
}

fn opt_text(
    name: &str,
    args: &[Option<Value>],
    i: usize,
) -> Result<Option<String>, ExpressionError> {
    match &args[i] {
        None => Ok(None),
        Some(v) => v
            .as_text()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| mismatch(name, "text", v)),
    }
}

fn opt_datetime(
    name: &str,
    args: &[Option<Value>],
    i: usize,
) -> Result<Option<DateTime<FixedOffset>>, ExpressionError> {
    match &args[i] {
        None => Ok(None),
        Some(v) => {
            let text = v
                .as_datetime()
                .ok_or_else(|| mismatch(name, "a datetime", v))?;
            DateTime::parse_from_rfc3339(text)
                .map(Some)
                .map_err(|e| mismatch_str(name, "an RFC-3339 datetime", &format!("{} ({})", text, e)))
        }
    }
}

fn text_unary(
    name: &str,
    args: &[Option<Value>],
    f: impl Fn(&str) -> String,
) -> Result<Option<Value>, ExpressionError> {
    arity(name, args, 1)?;
    match opt_text(name, args, 0)? {
        None => Ok(None),
        Some(s) => Ok(Some(Value::text(f(&s)))),
    }
}

fn number_unary(
    name: &str,
    args: &[Option<Value>],
    f: impl Fn(f64) -> f64,
) -> Result<Option<Value>, ExpressionError> {
    arity(name, args, 1)?;
    match opt_number(name, args, 0)? {
        None => Ok(None),
        Some(n) => Ok(Some(Value::number(f(n)))),
    }
}
