//! 后端资源配置。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 嵌入式协议栈的描述符表、收发缓冲、监听积压都是静态预算；把它们集中在一个
//!   [`SocketConfig`] 中，既可在代码里用构建器逐项覆盖，也可从 TOML 片段加载。
//! - BSD 后端只使用 `max_backlog`，其余字段由精简协议栈与回调式引擎消费。
//!
//! ## 契约（What）
//! - 所有字段均有默认值，TOML 中缺省的键沿用默认；未知键直接拒绝，避免拼写错误被静默吞掉；
//! - [`SocketConfig::validate`] 在后端构造时调用，任何为零的容量都视为配置错误。

use serde::Deserialize;

use crate::error::SocketError;

/// 套接字后端的资源预算。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SocketConfig {
    /// 精简协议栈描述符表容量。
    pub max_descriptors: usize,
    /// 每个 TCP 套接字的接收缓冲字节数。
    pub rx_buffer_size: usize,
    /// 每个 TCP 套接字的发送缓冲字节数。
    pub tx_buffer_size: usize,
    /// 每个 UDP 套接字可排队的报文数。
    pub udp_packet_slots: usize,
    /// `listen` 积压上限；调用方请求更大值时截断到此上限。
    pub max_backlog: usize,
    /// 回调式引擎中每个监听者可暂存的已建立连接数，超出的连接被中止。
    pub accept_queue_capacity: usize,
    /// 回调式引擎中每个连接在途（未被对端确认）的字节上限。
    pub send_buffer_size: usize,
    /// 临时端口分配的起点。
    pub ephemeral_port_start: u16,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            max_descriptors: 16,
            rx_buffer_size: 4096,
            tx_buffer_size: 4096,
            udp_packet_slots: 8,
            max_backlog: 8,
            accept_queue_capacity: 4,
            send_buffer_size: 4096,
            ephemeral_port_start: 49152,
        }
    }
}

impl SocketConfig {
    /// 返回默认配置。
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 TOML 片段解析配置并校验。
    pub fn from_toml_str(raw: &str) -> Result<Self, SocketError> {
        let config: Self = toml::from_str(raw).map_err(|err| SocketError::InvalidConfig {
            reason: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// 设置描述符表容量。
    pub fn with_max_descriptors(mut self, value: usize) -> Self {
        self.max_descriptors = value;
        self
    }

    /// 设置 TCP 收发缓冲大小。
    pub fn with_buffer_sizes(mut self, rx: usize, tx: usize) -> Self {
        self.rx_buffer_size = rx;
        self.tx_buffer_size = tx;
        self
    }

    /// 设置 `listen` 积压上限。
    pub fn with_max_backlog(mut self, value: usize) -> Self {
        self.max_backlog = value;
        self
    }

    /// 设置回调式引擎的接受队列容量。
    pub fn with_accept_queue_capacity(mut self, value: usize) -> Self {
        self.accept_queue_capacity = value;
        self
    }

    /// 设置回调式引擎的在途字节上限。
    pub fn with_send_buffer_size(mut self, value: usize) -> Self {
        self.send_buffer_size = value;
        self
    }

    /// 设置临时端口起点。
    pub fn with_ephemeral_port_start(mut self, value: u16) -> Self {
        self.ephemeral_port_start = value;
        self
    }

    /// 校验所有容量字段。
    pub fn validate(&self) -> Result<(), SocketError> {
        let zero_checks = [
            ("max_descriptors", self.max_descriptors),
            ("rx_buffer_size", self.rx_buffer_size),
            ("tx_buffer_size", self.tx_buffer_size),
            ("udp_packet_slots", self.udp_packet_slots),
            ("max_backlog", self.max_backlog),
            ("accept_queue_capacity", self.accept_queue_capacity),
            ("send_buffer_size", self.send_buffer_size),
        ];
        if let Some((name, _)) = zero_checks.iter().find(|(_, value)| *value == 0) {
            return Err(SocketError::InvalidConfig {
                reason: format!("`{name}` must be greater than zero"),
            });
        }
        if self.ephemeral_port_start == 0 {
            return Err(SocketError::InvalidConfig {
                reason: "`ephemeral_port_start` must be a non-zero port".to_owned(),
            });
        }
        Ok(())
    }

    /// 将调用方请求的积压值截断到 `[1, max_backlog]`。
    pub(crate) fn clamp_backlog(&self, requested: i32) -> usize {
        usize::try_from(requested)
            .unwrap_or(0)
            .clamp(1, self.max_backlog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config = SocketConfig::from_toml_str("max_descriptors = 4\n").unwrap();
        assert_eq!(config.max_descriptors, 4);
        assert_eq!(config.rx_buffer_size, SocketConfig::default().rx_buffer_size);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = SocketConfig::from_toml_str("max_descriptor = 4\n").unwrap_err();
        assert!(matches!(err, SocketError::InvalidConfig { .. }));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = SocketConfig::new().with_max_backlog(0).validate().unwrap_err();
        assert!(err.to_string().contains("max_backlog"));
    }

    #[test]
    fn backlog_is_clamped() {
        let config = SocketConfig::new().with_max_backlog(4);
        assert_eq!(config.clamp_backlog(-1), 1);
        assert_eq!(config.clamp_backlog(0), 1);
        assert_eq!(config.clamp_backlog(3), 3);
        assert_eq!(config.clamp_backlog(128), 4);
    }
}
