use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::error::{Error, Result};

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// 代理目标地址
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Address::Ip(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ip(addr) => Some(addr.ip()),
            Address::Domain(_, _) => None,
        }
    }

    /// 从 "host:port" 字符串解析；IP 字面量走 Ip 分支，其余按域名处理
    pub fn parse(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::Ip(addr));
        }
        let (host, port_str) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::AddressInvalid(format!("missing port in {:?}", s)))?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| Error::AddressInvalid(format!("invalid port in {:?}", s)))?;
        // 去掉 IPv6 字面量的方括号
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::AddressInvalid(format!("empty host in {:?}", s)));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Address::Ip(SocketAddr::new(ip, port)));
        }
        Ok(Address::Domain(host.to_string(), port))
    }

    /// 编码为隧道线上格式
    /// [ATYP: 1B][ADDR: 变长][PORT: 2B big-endian]
    /// ATYP: 0x01=IPv4, 0x03=Domain(1B 长度前缀), 0x04=IPv6
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Address::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Domain(domain, port) => {
                if domain.is_empty() {
                    return Err(Error::AddressInvalid("empty domain".to_string()));
                }
                if domain.len() > 255 {
                    return Err(Error::AddressInvalid(format!(
                        "domain too long: {} bytes",
                        domain.len()
                    )));
                }
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
        Ok(())
    }

    /// 编码为独立的字节向量
    pub fn encode_to_vec(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(self.host().len() + 4);
        self.encode(&mut buf)?;
        Ok(buf.to_vec())
    }

    /// 从字节切片解码，返回 (地址, 消耗的字节数)
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.is_empty() {
            return Err(Error::AddressInvalid("empty address data".to_string()));
        }
        match data[0] {
            ATYP_IPV4 => {
                if data.len() < 7 {
                    return Err(Error::AddressInvalid("short ipv4 address".to_string()));
                }
                let ip = Ipv4Addr::new(data[1], data[2], data[3], data[4]);
                let port = u16::from_be_bytes([data[5], data[6]]);
                Ok((Address::Ip(SocketAddr::new(IpAddr::V4(ip), port)), 7))
            }
            ATYP_DOMAIN => {
                if data.len() < 2 {
                    return Err(Error::AddressInvalid("short domain address".to_string()));
                }
                let len = data[1] as usize;
                if len == 0 {
                    return Err(Error::AddressInvalid("empty domain".to_string()));
                }
                let total = 2 + len + 2;
                if data.len() < total {
                    return Err(Error::AddressInvalid("short domain address".to_string()));
                }
                let domain = String::from_utf8(data[2..2 + len].to_vec())
                    .map_err(|_| Error::AddressInvalid("non-utf8 domain".to_string()))?;
                let port = u16::from_be_bytes([data[2 + len], data[3 + len]]);
                Ok((Address::Domain(domain, port), total))
            }
            ATYP_IPV6 => {
                if data.len() < 19 {
                    return Err(Error::AddressInvalid("short ipv6 address".to_string()));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[1..17]);
                let ip = Ipv6Addr::from(octets);
                let port = u16::from_be_bytes([data[17], data[18]]);
                Ok((Address::Ip(SocketAddr::new(IpAddr::V6(ip), port)), 19))
            }
            atyp => Err(Error::AddressInvalid(format!(
                "unsupported address type: 0x{:02x}",
                atyp
            ))),
        }
    }

    /// 从异步流读取一个地址记录
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let atyp = r.read_u8().await?;
        match atyp {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                r.read_exact(&mut octets).await?;
                let port = r.read_u16().await?;
                Ok(Address::Ip(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(octets)),
                    port,
                )))
            }
            ATYP_DOMAIN => {
                let len = r.read_u8().await? as usize;
                if len == 0 {
                    return Err(Error::AddressInvalid("empty domain".to_string()));
                }
                let mut name = vec![0u8; len];
                r.read_exact(&mut name).await?;
                let domain = String::from_utf8(name)
                    .map_err(|_| Error::AddressInvalid("non-utf8 domain".to_string()))?;
                let port = r.read_u16().await?;
                Ok(Address::Domain(domain, port))
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                r.read_exact(&mut octets).await?;
                let port = r.read_u16().await?;
                Ok(Address::Ip(SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(octets)),
                    port,
                )))
            }
            atyp => Err(Error::AddressInvalid(format!(
                "unsupported address type: 0x{:02x}",
                atyp
            ))),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}
