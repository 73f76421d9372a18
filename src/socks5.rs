//! SOCKS5 front-door (spec §4.13, §6). RFC 1928 no-auth and username/
//! password subnegotiations; `CONNECT` only. Domain takeover splices the
//! client into one of the internal loopback listeners bound by
//! [`crate::server`]; everything else is a direct, spliced TCP connection
//! to the real destination. Connection handling (accept loop, `Notify`
//! shutdown, per-connection task) mirrors `cmux-proxy`'s `handle_connect`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use regex::Regex;
use tokio::io::{copy_bidirectional, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::state::AppState;

const VERSION: u8 = 0x05;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_NETWORK_UNREACHABLE: u8 = 0x03;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

pub struct Socks5Handles {
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Socks5Handles {
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Destination the client asked to CONNECT to, before the takeover
/// decision is made.
struct Destination {
    host: String,
    port: u16,
}

pub async fn start(
    state: Arc<AppState>,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    loopback_http_addr: SocketAddr,
    loopback_https_addr: Option<SocketAddr>,
    shutdown: Arc<Notify>,
) -> std::io::Result<Socks5Handles> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let addr = listener.local_addr()?;
    let auth = Arc::new((username, password));

    let task = tokio::spawn(async move {
        info!(%addr, "socks5 listener started");
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!(%addr, "socks5 listener shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "socks5 accept error");
                            continue;
                        }
                    };
                    let state = state.clone();
                    let auth = auth.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(
                            stream,
                            state,
                            auth,
                            loopback_http_addr,
                            loopback_https_addr,
                        )
                        .await
                        {
                            warn!(remote = %remote_addr, error = %e, "socks5 connection error");
                        }
                    });
                }
            }
        }
    });

    Ok(Socks5Handles { addr, task })
}

async fn handle_connection(
    mut stream: TcpStream,
    state: Arc<AppState>,
    auth: Arc<(Option<String>, Option<String>)>,
    loopback_http_addr: SocketAddr,
    loopback_https_addr: Option<SocketAddr>,
) -> std::io::Result<()> {
    if !negotiate_method(&mut stream, &auth).await? {
        return Ok(());
    }

    let dest = match read_request(&mut stream).await? {
        RequestOutcome::Connect(dest) => dest,
        RequestOutcome::Unsupported(rep) => {
            write_reply(&mut stream, rep).await?;
            return Ok(());
        }
    };

    let cfg = state.config.load();
    let takeover = cfg
        .socks5
        .intercepted_domains
        .iter()
        .filter(|d| d.enabled)
        .find(|d| Regex::new(&d.pattern).map(|re| re.is_match(&dest.host)).unwrap_or(false));

    let target: Option<SocketAddr> = if let Some(entry) = takeover {
        info!(host = %dest.host, overlay = entry.overlay_mode, "socks5 domain takeover");
        if dest.port == 443 {
            match loopback_https_addr {
                Some(addr) => Some(addr),
                None => {
                    warn!(host = %dest.host, "https interception requested but no tls listener configured; passing through");
                    None
                }
            }
        } else {
            Some(loopback_http_addr)
        }
    } else {
        None
    };

    let target = match target {
        Some(addr) => addr,
        None => match state.dns_cache.resolve(&dest.host, dest.port).await {
            Ok(ip) => SocketAddr::new(ip, dest.port),
            Err(e) => {
                warn!(host = %dest.host, error = %e, "socks5 dns resolution failed");
                write_reply(&mut stream, REP_HOST_UNREACHABLE).await?;
                return Ok(());
            }
        },
    };

    let upstream = match TcpStream::connect(target).await {
        Ok(s) => s,
        Err(e) => {
            warn!(host = %dest.host, error = %e, "socks5 upstream connect failed");
            let rep = match e.kind() {
                std::io::ErrorKind::ConnectionRefused => REP_CONNECTION_REFUSED,
                std::io::ErrorKind::TimedOut => REP_NETWORK_UNREACHABLE,
                _ => REP_GENERAL_FAILURE,
            };
            write_reply(&mut stream, rep).await?;
            return Ok(());
        }
    };

    write_reply(&mut stream, REP_SUCCESS).await?;

    let (mut client_half, mut upstream_half) = (stream, upstream);
    match copy_bidirectional(&mut client_half, &mut upstream_half).await {
        Ok(_) => {}
        Err(e) => warn!(host = %dest.host, error = %e, "socks5 tunnel error"),
    }
    let _ = client_half.shutdown().await;
    let _ = upstream_half.shutdown().await;
    Ok(())
}

/// Returns `Ok(true)` if negotiation succeeded and the caller should read
/// the CONNECT request next; `Ok(false)` if the connection was closed
/// (no acceptable method).
async fn negotiate_method(stream: &mut TcpStream, auth: &(Option<String>, Option<String>)) -> std::io::Result<bool> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Ok(false);
    }
    let nmethods = header[1] as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    let requires_auth = auth.0.is_some();
    let chosen = if requires_auth && methods.contains(&METHOD_USER_PASS) {
        METHOD_USER_PASS
    } else if !requires_auth && methods.contains(&METHOD_NO_AUTH) {
        METHOD_NO_AUTH
    } else {
        stream.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        return Ok(false);
    };

    stream.write_all(&[VERSION, chosen]).await?;

    if chosen == METHOD_USER_PASS {
        if !authenticate(stream, auth).await? {
            return Ok(false);
        }
    }

    Ok(true)
}

async fn authenticate(stream: &mut TcpStream, auth: &(Option<String>, Option<String>)) -> std::io::Result<bool> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    let ulen = header[1] as usize;
    let mut uname = vec![0u8; ulen];
    stream.read_exact(&mut uname).await?;

    let mut plen_buf = [0u8; 1];
    stream.read_exact(&mut plen_buf).await?;
    let plen = plen_buf[0] as usize;
    let mut passwd = vec![0u8; plen];
    stream.read_exact(&mut passwd).await?;

    let expected_user = auth.0.as_deref().unwrap_or("").as_bytes();
    let expected_pass = auth.1.as_deref().unwrap_or("").as_bytes();
    let ok = uname == expected_user && passwd == expected_pass;

    stream.write_all(&[0x01, if ok { 0x00 } else { 0x01 }]).await?;
    Ok(ok)
}

enum RequestOutcome {
    Connect(Destination),
    Unsupported(u8),
}

async fn read_request(stream: &mut TcpStream) -> std::io::Result<RequestOutcome> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let (version, cmd, atyp) = (header[0], header[1], header[3]);
    if version != VERSION {
        return Ok(RequestOutcome::Unsupported(REP_GENERAL_FAILURE));
    }

    let host = match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await?;
            IpAddr::V4(Ipv4Addr::from(buf)).to_string()
        }
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            stream.read_exact(&mut len_buf).await?;
            let mut buf = vec![0u8; len_buf[0] as usize];
            stream.read_exact(&mut buf).await?;
            String::from_utf8(buf).map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid domain"))?
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 16];
            stream.read_exact(&mut buf).await?;
            IpAddr::V6(Ipv6Addr::from(buf)).to_string()
        }
        _ => return Ok(RequestOutcome::Unsupported(REP_ADDRESS_TYPE_NOT_SUPPORTED)),
    };

    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await?;
    let port = u16::from_be_bytes(port_buf);

    if cmd != CMD_CONNECT {
        return Ok(RequestOutcome::Unsupported(REP_COMMAND_NOT_SUPPORTED));
    }

    Ok(RequestOutcome::Connect(Destination { host, port }))
}

async fn write_reply(stream: &mut TcpStream, rep: u8) -> std::io::Result<()> {
    let mut reply = vec![VERSION, rep, 0x00, ATYP_IPV4];
    reply.extend_from_slice(&[0, 0, 0, 0]);
    reply.extend_from_slice(&[0, 0]);
    stream.write_all(&reply).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_codes_match_rfc1928_assignments() {
        assert_eq!(REP_SUCCESS, 0x00);
        assert_eq!(REP_GENERAL_FAILURE, 0x01);
        assert_eq!(REP_NETWORK_UNREACHABLE, 0x03);
        assert_eq!(REP_HOST_UNREACHABLE, 0x04);
        assert_eq!(REP_CONNECTION_REFUSED, 0x05);
        assert_eq!(REP_COMMAND_NOT_SUPPORTED, 0x07);
        assert_eq!(REP_ADDRESS_TYPE_NOT_SUPPORTED, 0x08);
    }
}
