//! # Engine Configuration
//!
//! String-keyed option maps parsed into typed configuration. Both the
//! cluster dataplane and the point-to-point engine accept the same option
//! vocabulary; unknown keys are ignored so deployments can carry
//! product-specific extras.

use crate::error::{KvError, KvResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

/// Option key: device ordinal, required, integer >= 0.
pub const OPT_DEVICE_ID: &str = "device_id";
/// Option key: listen endpoint, `"ip:port"`, `"[ipv6]:port"` or bare `"ip"`.
pub const OPT_LISTEN_IP_INFO: &str = "listen_ip_info";
/// Option key: staging buffer pool, `"num:size_in_mib"`; `"0:0"` disables.
pub const OPT_BUFFER_POOL: &str = "buffer_pool";
/// Option key: staging pool sizing as a JSON object.
pub const OPT_BUF_CFG: &str = "buf_cfg";
/// Option key: device memory pool config, JSON `{memory_size, page_shift?}`.
pub const OPT_MEM_POOL_CONFIG: &str = "mem_pool_config";
/// Option key: host memory pool config, same schema as the device pool.
pub const OPT_HOST_MEM_POOL_CONFIG: &str = "host_mem_pool_config";
/// Option key: response-flag wait budget in milliseconds.
pub const OPT_SYNC_KV_CACHE_WAIT_TIME: &str = "sync_kv_cache_wait_time";
/// Option key: enables the direct batch-get path.
pub const OPT_ENABLE_REMOTE_CACHE_ACCESSIBLE: &str = "enable_remote_cache_accessible";
/// Option key: permits `set_role` after initialization.
pub const OPT_ENABLE_SWITCH_ROLE: &str = "enable_switch_role";
/// Option key: RDMA traffic class forwarded to the communicator.
pub const OPT_RDMA_TRAFFIC_CLASS: &str = "rdma_traffic_class";
/// Option key: RDMA service level forwarded to the communicator.
pub const OPT_RDMA_SERVICE_LEVEL: &str = "rdma_service_level";
/// Option key: total linking time budget in milliseconds.
pub const OPT_LINK_TOTAL_TIME: &str = "link_total_time";
/// Option key: link retry count.
pub const OPT_LINK_RETRY_COUNT: &str = "link_retry_count";
/// Option key: local device topology description, JSON, version 1.0 or 1.2.
pub const OPT_LOCAL_COMM_RES: &str = "local_comm_res";

/// Default response-flag wait budget, milliseconds.
pub const DEFAULT_SYNC_KV_CACHE_WAIT_TIME_MS: u64 = 1000;
/// Default number of staging buffers per pool.
pub const DEFAULT_BUFFER_NUM: usize = 4;
/// Default size of one staging buffer, MiB.
pub const DEFAULT_BUFFER_SIZE_MIB: usize = 8;
/// Default page shift for memory pools (2 MiB pages).
pub const DEFAULT_PAGE_SHIFT: usize = 21;

/// Memory pool sizing, parsed from the `mem_pool_config` JSON value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemPoolConfig {
    /// Total pool size in bytes.
    pub memory_size: usize,

    /// Log2 of the page size. Defaults to 2 MiB pages.
    #[serde(default = "default_page_shift")]
    pub page_shift: usize,
}

fn default_page_shift() -> usize {
    DEFAULT_PAGE_SHIFT
}

/// Staging buffer pool sizing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BufferPoolConfig {
    /// Number of buffers per pool.
    pub buffer_num: usize,

    /// Size of each buffer in MiB.
    pub buffer_size_mib: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            buffer_num: DEFAULT_BUFFER_NUM,
            buffer_size_mib: DEFAULT_BUFFER_SIZE_MIB,
        }
    }
}

impl BufferPoolConfig {
    /// Parse the `"num:size_in_mib"` form; `"0:0"` disables the pool.
    pub fn parse(value: &str) -> KvResult<Self> {
        let (num, size) = value
            .split_once(':')
            .ok_or_else(|| KvError::ParamInvalid(format!("buffer_pool '{}' is not num:size", value)))?;
        let buffer_num = num
            .trim()
            .parse::<usize>()
            .map_err(|_| KvError::ParamInvalid(format!("buffer_pool count '{}' is not a number", num)))?;
        let buffer_size_mib = size
            .trim()
            .parse::<usize>()
            .map_err(|_| KvError::ParamInvalid(format!("buffer_pool size '{}' is not a number", size)))?;
        if (buffer_num == 0) != (buffer_size_mib == 0) {
            return Err(KvError::ParamInvalid(format!(
                "buffer_pool '{}': count and size must both be zero to disable",
                value
            )));
        }
        Ok(Self { buffer_num, buffer_size_mib })
    }

    /// True when the staging pool is disabled (`"0:0"`).
    pub fn is_disabled(&self) -> bool {
        self.buffer_num == 0
    }

    /// Size of each buffer in bytes.
    pub fn buffer_size_bytes(&self) -> usize {
        self.buffer_size_mib * 1024 * 1024
    }
}

/// Listen endpoint parsed from `listen_ip_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenInfo {
    /// Bind address.
    pub ip: IpAddr,

    /// Bind port; 0 lets the OS choose.
    pub port: u16,
}

impl ListenInfo {
    /// Parse `"ip:port"`, `"[ipv6]:port"` or bare `"ip"` (port 0).
    pub fn parse(value: &str) -> KvResult<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Err(KvError::ParamInvalid("listen_ip_info is empty".to_string()));
        }
        if let Some(rest) = value.strip_prefix('[') {
            let (ip, port) = rest
                .split_once(']')
                .ok_or_else(|| KvError::ParamInvalid(format!("listen_ip_info '{}' missing ']'", value)))?;
            let ip = ip
                .parse::<IpAddr>()
                .map_err(|_| KvError::ParamInvalid(format!("listen_ip_info '{}' has a bad ipv6", value)))?;
            let port = match port.strip_prefix(':') {
                Some(p) => p
                    .parse::<u16>()
                    .map_err(|_| KvError::ParamInvalid(format!("listen_ip_info '{}' has a bad port", value)))?,
                None if port.is_empty() => 0,
                None => {
                    return Err(KvError::ParamInvalid(format!(
                        "listen_ip_info '{}' has trailing junk",
                        value
                    )))
                }
            };
            return Ok(Self { ip, port });
        }
        if let Ok(addr) = value.parse::<SocketAddr>() {
            return Ok(Self { ip: addr.ip(), port: addr.port() });
        }
        if let Ok(ip) = value.parse::<IpAddr>() {
            return Ok(Self { ip, port: 0 });
        }
        Err(KvError::ParamInvalid(format!("listen_ip_info '{}' is not an address", value)))
    }

    /// Socket address form.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// Local device topology description, accepted at versions 1.0 and 1.2.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalCommRes {
    /// Schema version.
    pub version: String,

    /// Opaque topology payload forwarded to the communicator.
    #[serde(default)]
    pub topology: serde_json::Value,
}

/// Fully parsed engine options.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Device ordinal this engine drives.
    pub device_id: u32,

    /// Control-channel listen endpoint, when this engine accepts links.
    pub listen_info: Option<ListenInfo>,

    /// Staging buffer pool sizing.
    pub buffer_pool: BufferPoolConfig,

    /// Device memory pool sizing, when a device pool is requested.
    pub mem_pool: Option<MemPoolConfig>,

    /// Host memory pool sizing, when a host pool is requested.
    pub host_mem_pool: Option<MemPoolConfig>,

    /// Response-flag wait budget, milliseconds.
    pub sync_kv_cache_wait_time_ms: u64,

    /// Enables the direct batch-get path on both sides of a link.
    pub enable_remote_cache_accessible: bool,

    /// Permits `set_role` after initialization.
    pub enable_switch_role: bool,

    /// RDMA traffic class forwarded to the communicator config.
    pub rdma_traffic_class: Option<u32>,

    /// RDMA service level forwarded to the communicator config.
    pub rdma_service_level: Option<u32>,

    /// Total linking time budget, milliseconds.
    pub link_total_time_ms: u64,

    /// Link retry count.
    pub link_retry_count: u32,

    /// Optional local topology description.
    pub local_comm_res: Option<LocalCommRes>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            device_id: 0,
            listen_info: None,
            buffer_pool: BufferPoolConfig::default(),
            mem_pool: None,
            host_mem_pool: None,
            sync_kv_cache_wait_time_ms: DEFAULT_SYNC_KV_CACHE_WAIT_TIME_MS,
            enable_remote_cache_accessible: false,
            enable_switch_role: false,
            rdma_traffic_class: None,
            rdma_service_level: None,
            link_total_time_ms: 30_000,
            link_retry_count: 3,
            local_comm_res: None,
        }
    }
}

impl EngineOptions {
    /// Parse an option map. `device_id` is required; everything else has a
    /// default. Validation failures carry the offending key.
    pub fn from_map(options: &HashMap<String, String>) -> KvResult<Self> {
        let mut parsed = Self::default();

        let device_id = options
            .get(OPT_DEVICE_ID)
            .ok_or_else(|| KvError::ParamInvalid("device_id is required".to_string()))?;
        parsed.device_id = device_id
            .trim()
            .parse::<u32>()
            .map_err(|_| KvError::ParamInvalid(format!("device_id '{}' is not an integer >= 0", device_id)))?;

        if let Some(value) = options.get(OPT_LISTEN_IP_INFO) {
            parsed.listen_info = Some(ListenInfo::parse(value)?);
        }
        if let Some(value) = options.get(OPT_BUFFER_POOL) {
            parsed.buffer_pool = BufferPoolConfig::parse(value)?;
        }
        if let Some(value) = options.get(OPT_BUF_CFG) {
            parsed.buffer_pool = serde_json::from_str(value)
                .map_err(|e| KvError::ParamInvalid(format!("buf_cfg is not valid JSON: {}", e)))?;
        }
        if let Some(value) = options.get(OPT_MEM_POOL_CONFIG) {
            parsed.mem_pool = Some(Self::parse_pool_config(OPT_MEM_POOL_CONFIG, value)?);
        }
        if let Some(value) = options.get(OPT_HOST_MEM_POOL_CONFIG) {
            parsed.host_mem_pool = Some(Self::parse_pool_config(OPT_HOST_MEM_POOL_CONFIG, value)?);
        }
        if let Some(value) = options.get(OPT_SYNC_KV_CACHE_WAIT_TIME) {
            parsed.sync_kv_cache_wait_time_ms = Self::parse_u64(OPT_SYNC_KV_CACHE_WAIT_TIME, value)?;
        }
        if let Some(value) = options.get(OPT_ENABLE_REMOTE_CACHE_ACCESSIBLE) {
            parsed.enable_remote_cache_accessible = Self::parse_bool(OPT_ENABLE_REMOTE_CACHE_ACCESSIBLE, value)?;
        }
        if let Some(value) = options.get(OPT_ENABLE_SWITCH_ROLE) {
            parsed.enable_switch_role = Self::parse_bool(OPT_ENABLE_SWITCH_ROLE, value)?;
        }
        if let Some(value) = options.get(OPT_RDMA_TRAFFIC_CLASS) {
            parsed.rdma_traffic_class = Some(Self::parse_u64(OPT_RDMA_TRAFFIC_CLASS, value)? as u32);
        }
        if let Some(value) = options.get(OPT_RDMA_SERVICE_LEVEL) {
            parsed.rdma_service_level = Some(Self::parse_u64(OPT_RDMA_SERVICE_LEVEL, value)? as u32);
        }
        if let Some(value) = options.get(OPT_LINK_TOTAL_TIME) {
            parsed.link_total_time_ms = Self::parse_u64(OPT_LINK_TOTAL_TIME, value)?;
        }
        if let Some(value) = options.get(OPT_LINK_RETRY_COUNT) {
            parsed.link_retry_count = Self::parse_u64(OPT_LINK_RETRY_COUNT, value)? as u32;
        }
        if let Some(value) = options.get(OPT_LOCAL_COMM_RES) {
            let res: LocalCommRes = serde_json::from_str(value)
                .map_err(|e| KvError::ParamInvalid(format!("local_comm_res is not valid JSON: {}", e)))?;
            if res.version != "1.0" && res.version != "1.2" {
                return Err(KvError::ParamInvalid(format!(
                    "local_comm_res version '{}' is not supported (1.0 or 1.2)",
                    res.version
                )));
            }
            parsed.local_comm_res = Some(res);
        }

        Ok(parsed)
    }

    fn parse_pool_config(key: &str, value: &str) -> KvResult<MemPoolConfig> {
        let config: MemPoolConfig = serde_json::from_str(value)
            .map_err(|e| KvError::ParamInvalid(format!("{} is not valid JSON: {}", key, e)))?;
        if config.memory_size == 0 {
            return Err(KvError::ParamInvalid(format!("{}: memory_size must be > 0", key)));
        }
        Ok(config)
    }

    fn parse_u64(key: &str, value: &str) -> KvResult<u64> {
        value
            .trim()
            .parse::<u64>()
            .map_err(|_| KvError::ParamInvalid(format!("{} '{}' is not an integer", key, value)))
    }

    fn parse_bool(key: &str, value: &str) -> KvResult<bool> {
        match value.trim() {
            "1" | "true" | "True" => Ok(true),
            "0" | "false" | "False" => Ok(false),
            other => Err(KvError::ParamInvalid(format!("{} '{}' is not a boolean", key, other))),
        }
    }
}
