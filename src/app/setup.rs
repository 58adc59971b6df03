/// 交互式初始化
///
/// 逐项询问服务端参数，落盘 server/client 两份 JSON 配置并给出短链接。
use std::io::{BufRead, Write};

use anyhow::{Context, Result};

use crate::config::{self, shortlink, Config};
use crate::crypto;

pub struct WizardResult {
    pub server_config: Config,
    pub client_config: Config,
    pub server_config_path: String,
    pub client_config_path: String,
    pub short_link: String,
}

/// 运行设置向导。`default_server_path` 为服务端配置的默认输出路径，
/// `public_host` 为预填的对外主机名。
pub fn run_setup_wizard(default_server_path: &str, public_host: &str) -> Result<WizardResult> {
    let stdin = std::io::stdin();
    let mut reader = stdin.lock();

    println!("== Sudoku Server Setup ==");
    let host = prompt_string(&mut reader, "Server public host/IP", public_host, "127.0.0.1")?;
    let server_port = prompt_u16(&mut reader, "Server port", 8080)?;
    let mix_port = prompt_u16(&mut reader, "Client mixed proxy port", 1080)?;
    let fallback = prompt_string(
        &mut reader,
        "Fallback address for suspicious traffic",
        "",
        "127.0.0.1:80",
    )?;
    let mut aead = prompt_string(
        &mut reader,
        "AEAD (chacha20-poly1305 / aes-128-gcm / none)",
        "",
        "chacha20-poly1305",
    )?;
    let ascii = resolve_ascii(&prompt_string(
        &mut reader,
        "Encoding (ascii / entropy)",
        "",
        "entropy",
    )?);
    let suspicious = prompt_string(
        &mut reader,
        "Suspicious action (fallback / silent)",
        "",
        "fallback",
    )?;
    let padding_min = prompt_u16(&mut reader, "Padding min (%)", 5)?.min(100) as u8;
    let mut padding_max = prompt_u16(&mut reader, "Padding max (%)", 15)?.min(100) as u8;
    if padding_max < padding_min {
        println!("Padding max is smaller than min, using {} for both", padding_min);
        padding_max = padding_min;
    }

    let pure_input = prompt_string(&mut reader, "Enable pure Sudoku downlink? (yes/no)", "yes", "yes")?
        .to_lowercase();
    let enable_pure = pure_input != "no" && pure_input != "n";
    if !enable_pure && aead == "none" {
        println!("Bandwidth-optimized downlink requires AEAD. Forcing chacha20-poly1305.");
        aead = "chacha20-poly1305".to_string();
    }

    let key_input = prompt_string(&mut reader, "Shared key (leave empty to auto-generate)", "", "")?;
    let key = if key_input.trim().is_empty() {
        // 用公钥作为共享密钥，避免误把私钥散布出去
        let pair = crypto::generate_master_key();
        let key = crypto::encode_point(&pair.public);
        println!("Generated shared key: {}", key);
        key
    } else {
        key_input.trim().to_string()
    };

    let server_config = Config {
        mode: "server".to_string(),
        local_port: server_port,
        fallback_address: fallback,
        key: key.clone(),
        aead: aead.clone(),
        suspicious_action: suspicious,
        padding_min,
        padding_max,
        ascii: ascii.clone(),
        enable_pure_downlink: enable_pure,
        ..Config::default()
    };

    let client_config = Config {
        mode: "client".to_string(),
        local_port: mix_port,
        server_address: format!("{}:{}", host, server_port),
        key,
        aead,
        padding_min,
        padding_max,
        ascii,
        proxy_mode: "pac".to_string(),
        enable_pure_downlink: enable_pure,
        ..Config::default()
    };

    let server_path = prompt_string(
        &mut reader,
        "Server config output path",
        default_server_path,
        "config.server.json",
    )?;
    let client_path = prompt_string(
        &mut reader,
        "Client config output path",
        "client.config.json",
        "client.config.json",
    )?;

    config::save(&server_path, &server_config).context("save server config")?;
    config::save(&client_path, &client_config).context("save client config")?;

    let short_link = shortlink::build_short_link(&client_config, "").context("build short link")?;

    Ok(WizardResult {
        server_config,
        client_config,
        server_config_path: server_path,
        client_config_path: client_path,
        short_link,
    })
}

fn prompt_string(
    reader: &mut impl BufRead,
    label: &str,
    current: &str,
    fallback: &str,
) -> Result<String> {
    let display_default = if current.is_empty() { fallback } else { current };
    print!("{} [{}]: ", label, display_default);
    std::io::stdout().flush()?;

    let mut line = String::new();
    reader.read_line(&mut line)?;
    let line = line.trim();
    if line.is_empty() {
        Ok(display_default.to_string())
    } else {
        Ok(line.to_string())
    }
}

fn prompt_u16(reader: &mut impl BufRead, label: &str, default: u16) -> Result<u16> {
    print!("{} [{}]: ", label, default);
    std::io::stdout().flush()?;

    let mut line = String::new();
    reader.read_line(&mut line)?;
    let line = line.trim();
    if line.is_empty() {
        return Ok(default);
    }
    match line.parse() {
        Ok(v) => Ok(v),
        Err(_) => {
            println!("Invalid number, using {}", default);
            Ok(default)
        }
    }
}

fn resolve_ascii(val: &str) -> String {
    match val.trim().to_lowercase().as_str() {
        "ascii" | "prefer_ascii" => "prefer_ascii".to_string(),
        _ => "prefer_entropy".to_string(),
    }
}
