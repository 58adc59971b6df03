pub mod shortlink;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::{Error, Result};
use crate::obfs::{Table, TableSet};
use crate::tunnel::TunnelConfig;

/// 运行配置（JSON 持久化，字段与线上格式解耦）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// "client" 或 "server"
    pub mode: String,
    /// 监听端口：服务端为隧道端口，客户端为本地混合代理端口
    pub local_port: u16,
    /// 服务器地址 host:port（客户端）
    pub server_address: String,
    /// 诱饵地址 host:port（服务端）
    pub fallback_address: String,
    /// 预共享密钥；客户端可填私钥 blob，启动时恢复公钥作为种子
    pub key: String,
    /// "aes-128-gcm" | "chacha20-poly1305" | "none"
    pub aead: String,
    /// "fallback" | "silent"
    pub suspicious_action: String,
    pub padding_min: u8,
    pub padding_max: u8,
    /// "prefer_entropy"（默认）| "prefer_ascii"
    pub ascii: String,
    /// 可选 X/P/V 布局模式，如 "xpxvvpvv"
    pub custom_table: String,
    /// 可选多套布局轮换
    pub custom_tables: Vec<String>,
    /// false 时启用带宽优化的 6bit 下行，要求 AEAD 开启
    pub enable_pure_downlink: bool,
    /// 客户端不发伪装头；服务端始终自动探测
    pub disable_http_mask: bool,
    /// 服务端握手期限（秒）
    pub handshake_timeout_seconds: u64,
    /// "global" | "direct" | "pac"（由 Load 根据 rule_urls 归一化）
    pub proxy_mode: String,
    /// PAC 规则来源；["global"] / ["direct"] 为模式关键字
    pub rule_urls: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mode: String::new(),
            local_port: 0,
            server_address: String::new(),
            fallback_address: String::new(),
            key: String::new(),
            aead: String::new(),
            suspicious_action: "fallback".to_string(),
            padding_min: 0,
            padding_max: 0,
            ascii: String::new(),
            custom_table: String::new(),
            custom_tables: Vec::new(),
            enable_pure_downlink: true,
            disable_http_mask: false,
            handshake_timeout_seconds: 5,
            proxy_mode: String::new(),
            rule_urls: Vec::new(),
        }
    }
}

/// 读取并归一化配置文件
pub fn load(path: impl AsRef<Path>) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .map_err(|e| Error::ConfigInvalid(format!("read {}: {}", path.as_ref().display(), e)))?;
    let mut cfg: Config = serde_json::from_str(&content)
        .map_err(|e| Error::ConfigInvalid(format!("parse config: {}", e)))?;
    normalize(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

pub fn save(path: impl AsRef<Path>, cfg: &Config) -> Result<()> {
    let content = serde_json::to_string_pretty(cfg)
        .map_err(|e| Error::ConfigInvalid(format!("serialize config: {}", e)))?;
    std::fs::write(path.as_ref(), content)
        .map_err(|e| Error::ConfigInvalid(format!("write {}: {}", path.as_ref().display(), e)))?;
    Ok(())
}

fn normalize(cfg: &mut Config) {
    if cfg.ascii.is_empty() {
        cfg.ascii = "prefer_entropy".to_string();
    }
    if cfg.suspicious_action.is_empty() {
        cfg.suspicious_action = "fallback".to_string();
    }
    if cfg.handshake_timeout_seconds == 0 {
        cfg.handshake_timeout_seconds = 5;
    }

    // rule_urls 首项为模式关键字时覆盖 proxy_mode
    if let Some(first) = cfg.rule_urls.first() {
        if first == "global" || first == "direct" {
            cfg.proxy_mode = first.clone();
            cfg.rule_urls.clear();
        } else {
            cfg.proxy_mode = "pac".to_string();
        }
    } else if cfg.proxy_mode.is_empty() {
        cfg.proxy_mode = "global".to_string();
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        match self.mode.as_str() {
            "client" | "server" => {}
            m => {
                return Err(Error::ConfigInvalid(format!(
                    "mode must be \"client\" or \"server\", got {:?}",
                    m
                )))
            }
        }
        if self.key.is_empty() {
            return Err(Error::ConfigInvalid("key cannot be empty".to_string()));
        }
        match self.aead.as_str() {
            "aes-128-gcm" | "chacha20-poly1305" | "none" => {}
            m => {
                return Err(Error::ConfigInvalid(format!(
                    "invalid aead: {}, must be one of: aes-128-gcm, chacha20-poly1305, none",
                    m
                )))
            }
        }
        if self.padding_min > 100 || self.padding_max > 100 {
            return Err(Error::ConfigInvalid(
                "padding percentages must be within 0..=100".to_string(),
            ));
        }
        if self.padding_max < self.padding_min {
            return Err(Error::ConfigInvalid(format!(
                "padding_max ({}) must be >= padding_min ({})",
                self.padding_max, self.padding_min
            )));
        }
        if !self.enable_pure_downlink && self.aead == "none" {
            return Err(Error::ConfigInvalid(
                "enable_pure_downlink=false requires AEAD to be enabled".to_string(),
            ));
        }
        if self.mode == "client" && self.server_address.is_empty() {
            return Err(Error::ConfigInvalid(
                "server_address is required in client mode".to_string(),
            ));
        }
        Ok(())
    }

    /// 表布局模式列表：custom_tables 优先，其次 custom_table，否则单个空模式
    pub fn table_patterns(&self) -> Vec<String> {
        if !self.custom_tables.is_empty() {
            return self.custom_tables.clone();
        }
        if !self.custom_table.trim().is_empty() {
            return vec![self.custom_table.clone()];
        }
        vec![String::new()]
    }

    /// 按给定种子构建全部候选表
    pub fn build_tables(&self, seed: &str) -> Result<Vec<Arc<Table>>> {
        let set = TableSet::new(seed, &self.ascii, &self.table_patterns())?;
        Ok(set.candidates())
    }

    /// 生成隧道协议参数
    pub fn tunnel_config(&self, seed: String, tables: Vec<Arc<Table>>) -> TunnelConfig {
        TunnelConfig {
            seed,
            aead_method: self.aead.clone(),
            tables,
            padding_min: self.padding_min,
            padding_max: self.padding_max,
            enable_pure_downlink: self.enable_pure_downlink,
            disable_http_mask: self.disable_http_mask,
            handshake_timeout: Duration::from_secs(self.handshake_timeout_seconds),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            mode: "server".to_string(),
            local_port: 8443,
            key: "secret".to_string(),
            aead: "chacha20-poly1305".to_string(),
            ascii: "prefer_entropy".to_string(),
            padding_min: 5,
            padding_max: 15,
            ..Config::default()
        }
    }

    #[test]
    fn valid_config_passes() {
        base_config().validate().unwrap();
    }

    #[test]
    fn empty_key_rejected() {
        let mut cfg = base_config();
        cfg.key.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_aead_rejected() {
        let mut cfg = base_config();
        cfg.aead = "aes-256-gcm".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn inverted_padding_rejected() {
        let mut cfg = base_config();
        cfg.padding_min = 20;
        cfg.padding_max = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn packed_downlink_requires_aead() {
        let mut cfg = base_config();
        cfg.enable_pure_downlink = false;
        cfg.aead = "none".to_string();
        assert!(cfg.validate().is_err());
        cfg.aead = "aes-128-gcm".to_string();
        cfg.validate().unwrap();
    }

    #[test]
    fn client_requires_server_address() {
        let mut cfg = base_config();
        cfg.mode = "client".to_string();
        assert!(cfg.validate().is_err());
        cfg.server_address = "example.com:443".to_string();
        cfg.validate().unwrap();
    }

    #[test]
    fn normalize_applies_defaults_and_proxy_mode() {
        let mut cfg = Config {
            mode: "client".to_string(),
            key: "k".to_string(),
            aead: "none".to_string(),
            server_address: "1.2.3.4:443".to_string(),
            ascii: String::new(),
            ..Config::default()
        };
        normalize(&mut cfg);
        assert_eq!(cfg.ascii, "prefer_entropy");
        assert_eq!(cfg.proxy_mode, "global");
        assert_eq!(cfg.handshake_timeout_seconds, 5);

        let mut cfg2 = cfg.clone();
        cfg2.rule_urls = vec!["direct".to_string()];
        normalize(&mut cfg2);
        assert_eq!(cfg2.proxy_mode, "direct");
        assert!(cfg2.rule_urls.is_empty());

        let mut cfg3 = cfg.clone();
        cfg3.rule_urls = vec!["https://rules.example/cn.list".to_string()];
        normalize(&mut cfg3);
        assert_eq!(cfg3.proxy_mode, "pac");
    }

    #[test]
    fn table_patterns_priority() {
        let mut cfg = base_config();
        assert_eq!(cfg.table_patterns(), vec![String::new()]);

        cfg.custom_table = "xpxvvpvv".to_string();
        assert_eq!(cfg.table_patterns(), vec!["xpxvvpvv".to_string()]);

        cfg.custom_tables = vec!["xpxvvpvv".to_string(), "vxpvxvvp".to_string()];
        assert_eq!(cfg.table_patterns().len(), 2);
    }

    #[test]
    fn load_parses_json_with_defaults() {
        let dir = std::env::temp_dir().join("sudoku-tunnel-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(
            &path,
            r#"{
                "mode": "server",
                "local_port": 8443,
                "key": "test-key",
                "aead": "aes-128-gcm",
                "fallback_address": "127.0.0.1:80"
            }"#,
        )
        .unwrap();

        let cfg = load(&path).unwrap();
        assert_eq!(cfg.mode, "server");
        assert!(cfg.enable_pure_downlink);
        assert_eq!(cfg.ascii, "prefer_entropy");
        assert_eq!(cfg.suspicious_action, "fallback");
        std::fs::remove_file(&path).ok();
    }
}
