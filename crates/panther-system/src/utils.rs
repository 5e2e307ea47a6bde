//! 重试工具

use std::fmt::Display;
use tracing::warn;

/// 最多执行 `max_attempts` 次操作，每次失败后调用 `on_error`
///
/// `max_attempts` 为 0 时按 1 次处理。
///
/// # 返回值
///
/// 第一次成功的结果；全部失败时返回最后一次的错误。
/// `on_error` 自身失败时立即返回它的错误。
///
/// # 示例
///
/// ```rust
/// use panther_system::operation_with_attempts;
///
/// let mut calls = 0;
/// let result: Result<u32, String> = operation_with_attempts(
///     || {
///         calls += 1;
///         if calls < 3 { Err("busy".to_string()) } else { Ok(calls) }
///     },
///     5,
///     || Ok(()),
/// );
/// assert_eq!(result, Ok(3));
/// ```
pub fn operation_with_attempts<T, E, F, H>(
    mut operation: F,
    max_attempts: u32,
    mut on_error: H,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    H: FnMut() -> Result<(), E>,
    E: Display,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!("Attempt {} of {} failed: {}", attempt, max_attempts, err);
                if attempt >= max_attempts {
                    return Err(err);
                }
                on_error()?;
                attempt += 1;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_succeeds_first_time() {
        let mut on_error_calls = 0;
        let result: Result<i32, String> = operation_with_attempts(
            || Ok(7),
            3,
            || {
                on_error_calls += 1;
                Ok(())
            },
        );
        assert_eq!(result, Ok(7));
        assert_eq!(on_error_calls, 0);
    }

    #[test]
    fn test_exhausts_attempts() {
        let mut calls = 0;
        let mut on_error_calls = 0;
        let result: Result<(), String> = operation_with_attempts(
            || {
                calls += 1;
                Err(format!("failure {}", calls))
            },
            3,
            || {
                on_error_calls += 1;
                Ok(())
            },
        );
        assert_eq!(result, Err("failure 3".to_string()));
        assert_eq!(calls, 3);
        // 最后一次失败后不再调用 on_error
        assert_eq!(on_error_calls, 2);
    }

    #[test]
    fn test_on_error_failure_stops() {
        let mut calls = 0;
        let result: Result<(), String> = operation_with_attempts(
            || {
                calls += 1;
                Err("operation".to_string())
            },
            5,
            || Err("cleanup".to_string()),
        );
        assert_eq!(result, Err("cleanup".to_string()));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_zero_attempts_runs_once() {
        let mut calls = 0;
        let result: Result<(), String> = operation_with_attempts(
            || {
                calls += 1;
                Err("x".to_string())
            },
            0,
            || Ok(()),
        );
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
