/// sudoku:// 短链接
///
/// 载荷为 base64url（无填充）编码的紧凑 JSON：
///   h 服务器主机  p 端口  k 共享密钥（必填）
///   a 编码偏好    e AEAD  m 本地混合代理端口  x 打包下行开关
/// 解码得到一份带 PAC 默认规则的客户端配置。
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::Config;
use crate::common::{Error, Result};

const SCHEME: &str = "sudoku://";

const DEFAULT_RULE_URLS: &[&str] = &[
    "https://gh-proxy.org/https://raw.githubusercontent.com/blackmatrix7/ios_rule_script/master/rule/Clash/China/China.list",
    "https://gh-proxy.org/https://raw.githubusercontent.com/fernvenue/chn-cidr-list/master/ipv4.yaml",
];

#[derive(Serialize, Deserialize, Default)]
struct ShortLinkPayload {
    h: String,
    p: u16,
    k: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    a: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    e: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    m: u16,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    x: bool,
}

fn is_zero(v: &u16) -> bool {
    *v == 0
}

/// 从配置生成短链接。服务端配置（无 server_address）需提供 advertise_host。
pub fn build_short_link(cfg: &Config, advertise_host: &str) -> Result<String> {
    let (host, port) = derive_advertise_address(cfg, advertise_host)?;

    let mut payload = ShortLinkPayload {
        h: host,
        p: port,
        k: cfg.key.clone(),
        e: cfg.aead.clone(),
        ..Default::default()
    };

    if cfg.mode == "client" && cfg.local_port > 0 {
        payload.m = cfg.local_port;
    }
    if payload.m == 0 {
        payload.m = 1080;
    }
    payload.x = !cfg.enable_pure_downlink;
    payload.a = encode_ascii_mode(&cfg.ascii);
    if payload.e.is_empty() {
        payload.e = "chacha20-poly1305".to_string();
    }

    let json = serde_json::to_vec(&payload)
        .map_err(|e| Error::ConfigInvalid(format!("encode short link: {}", e)))?;
    Ok(format!("{}{}", SCHEME, URL_SAFE_NO_PAD.encode(json)))
}

/// 解析短链接为客户端配置（带 PAC 默认）
pub fn parse_short_link(link: &str) -> Result<Config> {
    let encoded = link
        .strip_prefix(SCHEME)
        .ok_or_else(|| Error::ConfigInvalid("invalid scheme".to_string()))?;
    let raw = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| Error::ConfigInvalid(format!("decode short link: {}", e)))?;
    let payload: ShortLinkPayload = serde_json::from_slice(&raw)
        .map_err(|e| Error::ConfigInvalid(format!("invalid short link payload: {}", e)))?;

    if payload.h.is_empty() || payload.p == 0 || payload.k.is_empty() {
        return Err(Error::ConfigInvalid(
            "short link missing required fields".to_string(),
        ));
    }

    let mut cfg = Config {
        mode: "client".to_string(),
        local_port: if payload.m > 0 { payload.m } else { 1080 },
        server_address: format!("{}:{}", payload.h, payload.p),
        key: payload.k,
        aead: if payload.e.is_empty() {
            "none".to_string()
        } else {
            payload.e
        },
        padding_min: 5,
        padding_max: 15,
        proxy_mode: "pac".to_string(),
        rule_urls: DEFAULT_RULE_URLS.iter().map(|s| s.to_string()).collect(),
        ..Config::default()
    };
    cfg.enable_pure_downlink = !payload.x;
    cfg.ascii = decode_ascii_mode(&payload.a);
    Ok(cfg)
}

fn encode_ascii_mode(mode: &str) -> String {
    match mode.to_lowercase().as_str() {
        "prefer_ascii" | "ascii" => "ascii".to_string(),
        _ => "entropy".to_string(),
    }
}

fn decode_ascii_mode(val: &str) -> String {
    match val.to_lowercase().as_str() {
        "ascii" | "prefer_ascii" => "prefer_ascii".to_string(),
        _ => "prefer_entropy".to_string(),
    }
}

fn derive_advertise_address(cfg: &Config, advertise_host: &str) -> Result<(String, u16)> {
    if !cfg.server_address.is_empty() {
        let (host, port_str) = cfg.server_address.rsplit_once(':').ok_or_else(|| {
            Error::ConfigInvalid(format!("invalid server_address {:?}", cfg.server_address))
        })?;
        let port: u16 = port_str.parse().map_err(|_| {
            Error::ConfigInvalid(format!("invalid port in server_address {:?}", cfg.server_address))
        })?;
        return Ok((host.to_string(), port));
    }

    if !advertise_host.is_empty() && cfg.local_port > 0 {
        return Ok((advertise_host.to_string(), cfg.local_port));
    }

    Err(Error::ConfigInvalid(
        "cannot derive server address; set server_address or provide advertise host".to_string(),
    ))
}
