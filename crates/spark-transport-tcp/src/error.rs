use spark_core::{CoreError, ErrorCategory, RetryAdvice, codes};
use std::borrow::Cow;
use std::io;
use std::time::Duration;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "spark.transport.tcp.bind_failed",
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "spark.transport.tcp.accept_failed",
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "spark.transport.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "spark.transport.tcp.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "spark.transport.tcp.write_failed",
    message: "tcp write",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "spark.transport.tcp.configure_failed",
    message: "tcp configure",
};

/// 将 IO 错误映射为框架级 CoreError，并附带错误分类与原始错误。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> CoreError {
    let category = categorize_io_error(&error);
    CoreError::new(
        kind.code,
        Cow::Owned(format!("{}: {}", kind.message, error)),
    )
    .with_category(category)
    .with_cause(error)
}

/// 输出队列或通道已关闭。
pub(crate) fn closed_error(operation: &'static str) -> CoreError {
    CoreError::new(
        codes::TRANSPORT_CLOSED,
        format!("{operation} rejected: channel closed"),
    )
    .with_category(ErrorCategory::NonRetryable)
}

/// 套接字在仍有待写字节时报告写入 0 字节。
pub(crate) fn write_zero_error() -> CoreError {
    CoreError::new(codes::TRANSPORT_IO, "tcp write: socket accepted zero bytes")
        .with_category(ErrorCategory::NonRetryable)
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut => ErrorCategory::Timeout,
        ErrorKind::WouldBlock | ErrorKind::Interrupted => {
            ErrorCategory::Retryable(RetryAdvice::after(Duration::from_millis(5)))
        }
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::AddrInUse
        | ErrorKind::AddrNotAvailable
        | ErrorKind::BrokenPipe => {
            ErrorCategory::Retryable(RetryAdvice::after(Duration::from_millis(50)))
        }
        ErrorKind::PermissionDenied | ErrorKind::Unsupported => ErrorCategory::NonRetryable,
        _ => ErrorCategory::NonRetryable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_operation_code_and_cause() {
        let err = map_io_error(WRITE, io::Error::from(io::ErrorKind::BrokenPipe));
        assert_eq!(err.code(), "spark.transport.tcp.write_failed");
        assert!(matches!(err.category(), ErrorCategory::Retryable(_)));
        assert!(std::error::Error::source(&err).is_some());

        let timeout = map_io_error(READ, io::Error::from(io::ErrorKind::TimedOut));
        assert_eq!(timeout.category(), ErrorCategory::Timeout);
    }
}
