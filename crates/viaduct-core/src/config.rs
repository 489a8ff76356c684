use std::time::Duration;

use serde::Deserialize;

use crate::error::{CommsError, Result};

/// 默认接收缓冲区大小（字节）。
pub const DEFAULT_RX_BUFFER_SIZE: usize = 4096;

/// 单条连接的可调参数。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - `rx_buffer_size`：固定容量的接收缓冲区，每次读取最多填满它；必须大于 0；
/// - `connect_timeout_ms`：建连（含握手）允许的总时长，`0` 表示不限制；
/// - `receive_timeout_ms`：空闲超时，读写任一成功都会重新计时，`0` 表示不启用；
/// - `no_delay`：仅 TCP 类适配器使用，建连成功后关闭 Nagle 合并。
///
/// ## 逻辑（How）
/// - 既可通过 `with_*` 方法在代码中组装，也可经 `serde` 从 TOML 片段反序列化，
///   缺省字段取 [`ConnectionConfig::default`] 的值；
/// - [`ConnectionConfig::validate`] 在注册连接前执行，非法配置直接拒绝而不是静默修正。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    rx_buffer_size: usize,
    connect_timeout_ms: u64,
    receive_timeout_ms: u64,
    no_delay: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            rx_buffer_size: DEFAULT_RX_BUFFER_SIZE,
            connect_timeout_ms: 0,
            receive_timeout_ms: 0,
            no_delay: true,
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 TOML 文本解析并校验配置。
    ///
    /// ```
    /// use viaduct_core::ConnectionConfig;
    ///
    /// let config = ConnectionConfig::from_toml_str("receive_timeout_ms = 250").unwrap();
    /// assert_eq!(config.rx_buffer_size(), 4096);
    /// assert_eq!(config.receive_timeout().map(|d| d.as_millis()), Some(250));
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ConnectionConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_rx_buffer_size(mut self, size: usize) -> Self {
        self.rx_buffer_size = size;
        self
    }

    /// 设置建连超时；`Duration::ZERO` 关闭该计时器。
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = duration_to_millis(timeout);
        self
    }

    /// 设置空闲（接收）超时；`Duration::ZERO` 关闭该计时器。
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout_ms = duration_to_millis(timeout);
        self
    }

    pub fn with_no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = enabled;
        self
    }

    pub fn rx_buffer_size(&self) -> usize {
        self.rx_buffer_size
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.connect_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.receive_timeout_ms)
    }

    pub fn no_delay(&self) -> bool {
        self.no_delay
    }

    pub fn validate(&self) -> Result<()> {
        if self.rx_buffer_size == 0 {
            return Err(CommsError::InvalidConfig(
                "rx_buffer_size must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }
}

fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn non_zero_millis(millis: u64) -> Option<Duration> {
    (millis != 0).then(|| Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_disable_both_timers() {
        let config = ConnectionConfig::default();
        assert_eq!(config.rx_buffer_size(), DEFAULT_RX_BUFFER_SIZE);
        assert!(config.connect_timeout().is_none());
        assert!(config.receive_timeout().is_none());
        assert!(config.no_delay());
    }

    #[test]
    fn zero_duration_disables_timer() {
        let config = ConnectionConfig::new()
            .with_connect_timeout(Duration::from_millis(50))
            .with_receive_timeout(Duration::ZERO);
        assert_eq!(config.connect_timeout(), Some(Duration::from_millis(50)));
        assert_eq!(config.receive_timeout(), None);
    }

    #[test]
    fn toml_rejects_unknown_keys_and_zero_buffer() {
        assert!(matches!(
            ConnectionConfig::from_toml_str("rx_buffer = 10"),
            Err(CommsError::ConfigParse(_))
        ));
        assert!(matches!(
            ConnectionConfig::from_toml_str("rx_buffer_size = 0"),
            Err(CommsError::InvalidConfig(_))
        ));
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let config = ConnectionConfig::from_toml_str(
            "rx_buffer_size = 2048\nconnect_timeout_ms = 75\nno_delay = false",
        )
        .expect("parse config");
        assert_eq!(config.rx_buffer_size(), 2048);
        assert_eq!(config.connect_timeout(), Some(Duration::from_millis(75)));
        assert!(!config.no_delay());
    }
}
