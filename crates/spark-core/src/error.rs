use std::{borrow::Cow, error::Error as StdError, fmt, time::Duration};

/// `CoreError` 表示缓冲核心与传输层共享的稳定错误域，是所有可观察错误的最终形态。
///
/// # 设计背景（Why）
/// - Arena 回退、输出队列关闭、套接字读写失败等故障发生在不同层次，需要合流为统一的错误码，
///   以便日志与告警系统执行精确的自动化治理；
/// - I/O 故障会被上抛给管道，由管道决定用户可见行为，因此错误必须携带可机读的分类。
///
/// # 逻辑解析（How）
/// - 错误码 `code` 始终为 `'static` 字符串，承载稳定语义；`message` 面向排障人员；
/// - 通过 Builder 风格的 `with_cause`/`with_category` 叠加底层原因与处置分类，`source()` 暴露完整链路。
///
/// # 契约说明（What）
/// - **前置条件**：调用方必须使用 [`codes`] 模块或遵循 `<域>.<语义>` 约定的自定义码值；
/// - **后置条件**：返回的错误拥有独立所有权，满足 `Send + Sync + 'static`。
///
/// # 设计取舍与风险（Trade-offs）
/// - 采用 `Cow<'static, str>` 保存消息，静态文案零分配，动态拼接时才付出一次堆分配。
#[derive(Debug)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<ErrorCause>,
    category: Option<ErrorCategory>,
}

/// `ErrorCause` 封装底层原因，保持 `Send + Sync` 以方便跨线程传递。
pub type ErrorCause = Box<dyn StdError + Send + Sync + 'static>;

/// 框架统一的返回值别名，默认错误类型为 [`CoreError`]。
pub type Result<T, E = CoreError> = core::result::Result<T, E>;

impl CoreError {
    /// 构造核心错误。
    ///
    /// # 示例（Examples）
    /// ```rust
    /// use spark_core::{CoreError, codes};
    ///
    /// let err = CoreError::new(codes::TRANSPORT_CLOSED, "channel already closed");
    /// assert_eq!(err.code(), codes::TRANSPORT_CLOSED);
    /// assert_eq!(err.message(), "channel already closed");
    /// assert!(err.cause().is_none());
    /// ```
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            category: None,
        }
    }

    /// 附带底层原因并返回新的核心错误。
    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// 为错误标记结构化分类信息，驱动上层的自动化容错策略。
    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// 获取结构化错误分类。
    ///
    /// # 契约说明（What）
    /// - 显式设置的分类优先；
    /// - 未设置时按错误码查默认表，查表失败回退为 [`ErrorCategory::NonRetryable`]。
    pub fn category(&self) -> ErrorCategory {
        self.category
            .clone()
            .or_else(|| default_category(self.code))
            .unwrap_or(ErrorCategory::NonRetryable)
    }

    /// 获取稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 获取描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 获取底层原因。
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// 返回适合值班人员阅读的“人话”描述，未登记的错误码回退为原始消息。
    pub fn human(&self) -> Cow<'static, str> {
        lookup_human(self.code)
            .map(Cow::Borrowed)
            .unwrap_or_else(|| self.message.clone())
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl StdError for CoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_ref()
            .map(|boxed| boxed.as_ref() as &(dyn StdError + 'static))
    }
}

/// 错误分类枚举，驱动自动化容错策略。
///
/// - `Retryable`：携带退避建议 [`RetryAdvice`]；
/// - `ResourceExhausted`：资源耗尽；Arena 空间不足不属于此类，它由独立缓冲回退吸收；
/// - 其余分支对应确定性的策略，`Timeout`/`Cancelled` 触发取消，`ProtocolViolation` 触发关闭。
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    Retryable(RetryAdvice),
    NonRetryable,
    ResourceExhausted,
    ProtocolViolation,
    Cancelled,
    Timeout,
}

/// 重试建议：调用方应至少等待 `wait` 之后再发起下一次尝试。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryAdvice {
    pub wait: Duration,
}

impl RetryAdvice {
    /// 构造在 `wait` 之后重试的建议。
    pub const fn after(wait: Duration) -> Self {
        Self { wait }
    }
}

/// 框架内置的错误码常量集合，确保可观测性系统具有稳定识别符。
///
/// 错误码遵循 `<领域>.<语义>` 命名约定，方便在跨组件日志中检索与聚合。
pub mod codes {
    /// 传输层 I/O 错误。
    pub const TRANSPORT_IO: &str = "transport.io";
    /// 通道已关闭，拒绝新的写入或刷新。
    pub const TRANSPORT_CLOSED: &str = "transport.closed";
    /// 引用计数协议被违反（对已释放对象 retain/release）。
    pub const BUFFER_REFCOUNT_VIOLATION: &str = "buffer.refcount_violation";
    /// 配置解析或校验失败。
    pub const CONFIG_INVALID: &str = "config.invalid";
    /// 运行时不可用（例如在 Tokio 运行时之外建连）。
    pub const RUNTIME_UNAVAILABLE: &str = "runtime.unavailable";
}

fn default_category(code: &str) -> Option<ErrorCategory> {
    match code {
        codes::TRANSPORT_IO => Some(ErrorCategory::Retryable(RetryAdvice::after(
            Duration::from_millis(50),
        ))),
        codes::BUFFER_REFCOUNT_VIOLATION => Some(ErrorCategory::ProtocolViolation),
        _ => None,
    }
}

fn lookup_human(code: &str) -> Option<&'static str> {
    match code {
        codes::TRANSPORT_IO => Some("传输层 I/O 故障：底层连接已断开或发生读写失败"),
        codes::TRANSPORT_CLOSED => Some("通道已关闭：连接已进入关闭流程，不再接受写入"),
        codes::BUFFER_REFCOUNT_VIOLATION => Some("引用计数违例：对已归零的共享缓冲执行了 retain/release"),
        codes::CONFIG_INVALID => Some("配置无效：I/O 配置缺失或取值越界"),
        _ => None,
    }
}

const _: fn() = || {
    fn assert_error_traits<T: StdError + Send + Sync + 'static>() {}

    assert_error_traits::<CoreError>();
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn explicit_category_overrides_code_default() {
        let err = CoreError::new(codes::TRANSPORT_IO, "tcp write: broken pipe")
            .with_category(ErrorCategory::NonRetryable);
        assert_eq!(err.category(), ErrorCategory::NonRetryable);

        let defaulted = CoreError::new(codes::BUFFER_REFCOUNT_VIOLATION, "retain on dead buffer");
        assert_eq!(defaulted.category(), ErrorCategory::ProtocolViolation);
    }

    #[test]
    fn source_chain_exposes_io_cause() {
        let err = CoreError::new(codes::TRANSPORT_IO, "tcp read")
            .with_cause(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"));
        let source = err.source().expect("cause must be exposed");
        assert_eq!(source.to_string(), "reset by peer");
        assert_eq!(format!("{err}"), "[transport.io] tcp read");
    }

    #[test]
    fn human_falls_back_to_message() {
        let err = CoreError::new("custom.code", "自定义错误");
        assert_eq!(err.human(), "自定义错误");
        let known = CoreError::new(codes::TRANSPORT_CLOSED, "closed");
        assert!(known.human().starts_with("通道已关闭"));
    }
}
