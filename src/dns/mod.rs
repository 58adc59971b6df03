/// 服务器地址解析：并发 A/AAAA 查询 + 乐观缓存
///
/// - IP 字面量直接放行，不触发 DNS
/// - 新鲜缓存命中直接返回
/// - 缓存过期后解析失败则回退到陈旧 IP（乐观缓存）
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use hickory_resolver::config::{LookupIpStrategy, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tracing::debug;

use crate::common::{Error, Result};

const DEFAULT_TTL: Duration = Duration::from_secs(600);
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

struct CacheEntry {
    ip: IpAddr,
    expires_at: Instant,
}

pub struct CachedResolver {
    resolver: TokioAsyncResolver,
    cache: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl Default for CachedResolver {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl CachedResolver {
    pub fn new(ttl: Duration) -> Self {
        let mut opts = ResolverOpts::default();
        // A/AAAA 并发查询，任一先返回即可用
        opts.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
        opts.timeout = LOOKUP_TIMEOUT;
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), opts);
        CachedResolver {
            resolver,
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// 把 "host:port" 解析为 "ip:port"
    pub async fn resolve(&self, addr: &str) -> Result<String> {
        let (host, port_str) = addr
            .rsplit_once(':')
            .ok_or_else(|| Error::AddressInvalid(format!("invalid address {:?}", addr)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() || port_str.parse::<u16>().is_err() {
            return Err(Error::AddressInvalid(format!("invalid address {:?}", addr)));
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(join_host_port(ip, port_str));
        }

        let now = Instant::now();
        let (cached, expired) = self.lookup_cache(host, now);
        if let Some(ip) = cached {
            if !expired {
                return Ok(join_host_port(ip, port_str));
            }
        }

        match self.resolver.lookup_ip(host).await {
            Ok(response) => {
                let Some(ip) = response.iter().next() else {
                    // 没有可用记录也按乐观缓存回退
                    if let Some(stale) = cached {
                        return Ok(join_host_port(stale, port_str));
                    }
                    return Err(Error::Transport(format!("no usable ip for host {}", host)));
                };
                self.store(host, ip, now);
                debug!(host = host, ip = %ip, "dns resolved");
                Ok(join_host_port(ip, port_str))
            }
            Err(e) => {
                if let Some(stale) = cached {
                    debug!(host = host, ip = %stale, "dns failed, serving stale");
                    return Ok(join_host_port(stale, port_str));
                }
                Err(Error::Transport(format!("dns lookup failed for {}: {}", host, e)))
            }
        }
    }

    fn lookup_cache(&self, host: &str, now: Instant) -> (Option<IpAddr>, bool) {
        let cache = self.cache.read().unwrap();
        match cache.get(host) {
            Some(entry) => (Some(entry.ip), now > entry.expires_at),
            None => (None, false),
        }
    }

    fn store(&self, host: &str, ip: IpAddr, now: Instant) {
        self.cache.write().unwrap().insert(
            host.to_string(),
            CacheEntry {
                ip,
                expires_at: now + self.ttl,
            },
        );
    }
}

fn join_host_port(ip: IpAddr, port: &str) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{}:{}", v4, port),
        IpAddr::V6(v6) => format!("[{}]:{}", v6, port),
    }
}
