//! FILENAME: engine/src/formula.rs
//! PURPOSE: Evaluates formula ASTs to a number.
//! CONTEXT: The formula aggregation method substitutes references first, then
//! hands the remaining arithmetic to the parser crate. This module folds the
//! resulting tree. Comparisons and logical operators yield 1.0 or 0.0.
//!
//! SUPPORTED FUNCTIONS:
//! - abs, ceil, floor, sqrt, exp, log (natural), log10
//! - round(x), roundn(x, places), pow(x, y)
//! - min, max, sum, avg (variadic)
//! - if(cond, then, else), evaluated lazily
//! - clamp(x, lo, hi)

use crate::error::{EngineError, EngineResult};
use crate::numeric::round_half_up;
use parser::{BinaryOperator, Expression, UnaryOperator};

/// Parses and evaluates a fully substituted formula.
pub fn evaluate_formula(text: &str) -> EngineResult<f64> {
    let expr = parser::parse(text).map_err(|e| EngineError::FormulaEvaluation(e.message))?;
    let value = evaluate(&expr)?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(EngineError::FormulaEvaluation(format!("non-finite result for '{}'", text)))
    }
}

fn fail(message: impl Into<String>) -> EngineError {
    EngineError::FormulaEvaluation(message.into())
}

fn truth(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

pub fn evaluate(expr: &Expression) -> EngineResult<f64> {
    match expr {
        Expression::Number(n) => Ok(*n),
        Expression::Constant(name) => eval_constant(name),
        Expression::UnaryOp { op, operand } => {
            let value = evaluate(operand)?;
            match op {
                UnaryOperator::Negate => Ok(-value),
            }
        }
        Expression::BinaryOp { left, op, right } => eval_binary_op(left, *op, right),
        Expression::FunctionCall { name, args } => eval_function(name, args),
    }
}

fn eval_constant(name: &str) -> EngineResult<f64> {
    match name {
        "pi" => Ok(std::f64::consts::PI),
        "e" => Ok(std::f64::consts::E),
        "true" => Ok(1.0),
        "false" => Ok(0.0),
        other => Err(fail(format!("unknown name '{}'", other))),
    }
}

fn eval_binary_op(left: &Expression, op: BinaryOperator, right: &Expression) -> EngineResult<f64> {
    let l = evaluate(left)?;

    // Logical operators short-circuit
    match op {
        BinaryOperator::And if l == 0.0 => return Ok(0.0),
        BinaryOperator::Or if l != 0.0 => return Ok(1.0),
        _ => {}
    }

    let r = evaluate(right)?;
    let value = match op {
        BinaryOperator::Add => l + r,
        BinaryOperator::Subtract => l - r,
        BinaryOperator::Multiply => l * r,
        BinaryOperator::Divide => {
            if r == 0.0 {
                return Err(fail("division by zero"));
            }
            l / r
        }
        BinaryOperator::Modulo => {
            if r == 0.0 {
                return Err(fail("modulo by zero"));
            }
            l % r
        }
        BinaryOperator::Power => l.powf(r),
        BinaryOperator::Equal => truth(l == r),
        BinaryOperator::NotEqual => truth(l != r),
        BinaryOperator::LessThan => truth(l < r),
        BinaryOperator::GreaterThan => truth(l > r),
        BinaryOperator::LessEqual => truth(l <= r),
        BinaryOperator::GreaterEqual => truth(l >= r),
        BinaryOperator::And | BinaryOperator::Or => truth(r != 0.0),
    };
    Ok(value)
}

fn eval_function(name: &str, args: &[Expression]) -> EngineResult<f64> {
    match name {
        "if" => {
            expect_arity(name, args, 3)?;
            if evaluate(&args[0])? != 0.0 {
                evaluate(&args[1])
            } else {
                evaluate(&args[2])
            }
        }
        "abs" => unary(name, args, f64::abs),
        "ceil" => unary(name, args, f64::ceil),
        "floor" => unary(name, args, f64::floor),
        "exp" => unary(name, args, f64::exp),
        "round" => unary(name, args, |x| round_half_up(x, 0)),
        "sqrt" => {
            let x = single(name, args)?;
            if x < 0.0 {
                return Err(fail("sqrt of a negative number"));
            }
            Ok(x.sqrt())
        }
        "log" | "log10" => {
            let x = single(name, args)?;
            if x <= 0.0 {
                return Err(fail(format!("{} of a non-positive number", name)));
            }
            Ok(if name == "log" { x.ln() } else { x.log10() })
        }
        "roundn" => {
            expect_arity(name, args, 2)?;
            let x = evaluate(&args[0])?;
            let places = evaluate(&args[1])?;
            if !(0.0..=15.0).contains(&places) {
                return Err(fail("roundn places must be between 0 and 15"));
            }
            Ok(round_half_up(x, places as u32))
        }
        "pow" => {
            expect_arity(name, args, 2)?;
            Ok(evaluate(&args[0])?.powf(evaluate(&args[1])?))
        }
        "clamp" => {
            expect_arity(name, args, 3)?;
            let x = evaluate(&args[0])?;
            let lo = evaluate(&args[1])?;
            let hi = evaluate(&args[2])?;
            if lo > hi {
                return Err(fail("clamp bounds are reversed"));
            }
            Ok(x.clamp(lo, hi))
        }
        "min" | "max" | "sum" | "avg" => {
            if args.is_empty() {
                return Err(fail(format!("{} needs at least one argument", name)));
            }
            let values = args.iter().map(evaluate).collect::<EngineResult<Vec<f64>>>()?;
            let value = match name {
                "min" => values.iter().copied().fold(f64::INFINITY, f64::min),
                "max" => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                "sum" => values.iter().sum(),
                _ => values.iter().sum::<f64>() / values.len() as f64,
            };
            Ok(value)
        }
        other => Err(fail(format!("unknown function '{}'", other))),
    }
}

fn expect_arity(name: &str, args: &[Expression], n: usize) -> EngineResult<()> {
    if args.len() == n {
        Ok(())
    } else {
        Err(fail(format!("{} expects {} arguments, got {}", name, n, args.len())))
    }
}

fn single(name: &str, args: &[Expression]) -> EngineResult<f64> {
    expect_arity(name, args, 1)?;
    evaluate(&args[0])
}

fn unary(name: &str, args: &[Expression], f: impl Fn(f64) -> f64) -> EngineResult<f64> {
    single(name, args).map(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respects_operator_precedence() {
        assert_eq!(evaluate_formula("3 + 5 * 2").unwrap(), 13.0);
        assert_eq!(evaluate_formula("(3 + 5) * 2").unwrap(), 16.0);
        assert_eq!(evaluate_formula("-2 ^ 2").unwrap(), -4.0);
        assert_eq!(evaluate_formula("(-2) ^ 2").unwrap(), 4.0);
        assert_eq!(evaluate_formula("2 ^ 3 ^ 2").unwrap(), 512.0);
    }

    #[test]
    fn functions_and_constants() {
        assert_eq!(evaluate_formula("max(1, 7, 3)").unwrap(), 7.0);
        assert_eq!(evaluate_formula("avg(2, 4)").unwrap(), 3.0);
        assert_eq!(evaluate_formula("roundn(2.675, 2)").unwrap(), 2.68);
        assert_eq!(evaluate_formula("if(3 > 2, 10, 20)").unwrap(), 10.0);
        assert_eq!(evaluate_formula("clamp(12, 0, 10)").unwrap(), 10.0);
        assert!((evaluate_formula("pi").unwrap() - std::f64::consts::PI).abs() < 1e-12);
    }

    #[test]
    fn if_is_lazy() {
        assert_eq!(evaluate_formula("if(0, 1 / 0, 5)").unwrap(), 5.0);
    }

    #[test]
    fn failures_are_formula_errors() {
        for text in ["1 / 0", "5 % 0", "sqrt(-1)", "nosuch(1)", "3 +", "abc", "log(0)"] {
            assert!(
                matches!(evaluate_formula(text), Err(EngineError::FormulaEvaluation(_))),
                "expected failure for {}",
                text
            );
        }
    }

    #[test]
    fn comparisons_and_logic_yield_flags() {
        assert_eq!(evaluate_formula("2 < 3 and 4 != 4").unwrap(), 0.0);
        assert_eq!(evaluate_formula("2 < 3 or 1 / 0").unwrap(), 1.0);
        assert_eq!(evaluate_formula("3 == 3").unwrap(), 1.0);
    }
}
