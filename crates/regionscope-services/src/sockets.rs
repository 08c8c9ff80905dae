//! Socket enumeration for a target process.
//!
//! Two sources, tried in order:
//!   1. kernel socket tables (`/proc/net/{tcp,tcp6,udp,udp6}`) with owners
//!      resolved through `/proc/<pid>/fd` socket inodes
//!   2. the text dump of `ss`, which may see owners we cannot (setuid/caps)
//!
//! Sources report every socket with the owner they could determine. The
//! enumerator filters by pid and never fails: total failure is an empty list.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::{Command, Stdio};

use procfs::process::{all_processes, FDTarget};

use regionscope_core::{Protocol, SocketRecord, TcpState};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("procfs: {0}")]
    Procfs(#[from] procfs::ProcError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} exited with {1}")]
    CommandFailed(&'static str, std::process::ExitStatus),
}

pub trait SocketSource: Send + Sync {
    fn name(&self) -> &'static str;
    fn tcp(&self) -> Result<Vec<SocketRecord>, SourceError>;
    fn udp(&self) -> Result<Vec<SocketRecord>, SourceError>;
}

// ── procfs ────────────────────────────────────────────────────────────────────

pub struct ProcfsSource;

impl ProcfsSource {
    /// Socket inode → owning pid, for every process whose fds we can read.
    fn owners() -> Result<HashMap<u64, u32>, SourceError> {
        let mut owners = HashMap::new();
        for process in all_processes()?.flatten() {
            let Ok(pid) = u32::try_from(process.pid()) else {
                continue;
            };
            // Unreadable fd tables (other users' processes) are expected.
            let Ok(fds) = process.fd() else {
                continue;
            };
            for fd in fds.flatten() {
                if let FDTarget::Socket(inode) = fd.target {
                    owners.insert(inode, pid);
                }
            }
        }
        Ok(owners)
    }
}

fn map_tcp_state(state: &procfs::net::TcpState) -> TcpState {
    use procfs::net::TcpState as K;
    match state {
        K::Established => TcpState::Established,
        K::SynSent => TcpState::SynSent,
        K::SynRecv => TcpState::SynRecv,
        K::FinWait1 => TcpState::FinWait1,
        K::FinWait2 => TcpState::FinWait2,
        K::TimeWait => TcpState::TimeWait,
        K::Close => TcpState::Close,
        K::CloseWait => TcpState::CloseWait,
        K::LastAck => TcpState::LastAck,
        K::Listen => TcpState::Listen,
        K::Closing => TcpState::Closing,
        K::NewSynRecv => TcpState::NewSynRecv,
        #[allow(unreachable_patterns)]
        _ => TcpState::Close,
    }
}

fn owner_of(owners: &HashMap<u64, u32>, inode: u64) -> Option<u32> {
    // Inode 0 is a socket no longer attached to any fd (TIME_WAIT etc).
    if inode == 0 {
        return None;
    }
    owners.get(&inode).copied()
}

impl SocketSource for ProcfsSource {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn tcp(&self) -> Result<Vec<SocketRecord>, SourceError> {
        let owners = Self::owners()?;
        let mut entries = procfs::net::tcp()?;
        // tcp6 is absent on kernels without IPv6.
        if let Ok(v6) = procfs::net::tcp6() {
            entries.extend(v6);
        }
        Ok(entries
            .into_iter()
            .map(|e| SocketRecord {
                protocol: Protocol::Tcp,
                local: e.local_address,
                remote: Some(e.remote_address),
                pid: owner_of(&owners, e.inode),
                tcp_state: Some(map_tcp_state(&e.state)),
            })
            .collect())
    }

    fn udp(&self) -> Result<Vec<SocketRecord>, SourceError> {
        let owners = Self::owners()?;
        let mut entries = procfs::net::udp()?;
        if let Ok(v6) = procfs::net::udp6() {
            entries.extend(v6);
        }
        Ok(entries
            .into_iter()
            .map(|e| SocketRecord {
                protocol: Protocol::Udp,
                local: e.local_address,
                remote: Some(e.remote_address),
                pid: owner_of(&owners, e.inode),
                tcp_state: None,
            })
            .collect())
    }
}

// ── ss ────────────────────────────────────────────────────────────────────────

pub struct SsSource;

impl SsSource {
    fn run(flag: &str, protocol: Protocol) -> Result<Vec<SocketRecord>, SourceError> {
        let output = Command::new("ss")
            .args(["-H", flag, "-a", "-n", "-p"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()?;
        if !output.status.success() {
            return Err(SourceError::CommandFailed("ss", output.status));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(parse_ss_output(&text, protocol))
    }
}

impl SocketSource for SsSource {
    fn name(&self) -> &'static str {
        "ss"
    }

    fn tcp(&self) -> Result<Vec<SocketRecord>, SourceError> {
        Self::run("-t", Protocol::Tcp)
    }

    fn udp(&self) -> Result<Vec<SocketRecord>, SourceError> {
        Self::run("-u", Protocol::Udp)
    }
}

/// Parse `ss -H -{t,u}anp` output. Lines that do not parse are skipped.
pub fn parse_ss_output(text: &str, protocol: Protocol) -> Vec<SocketRecord> {
    text.lines()
        .filter_map(|line| parse_ss_line(line, protocol))
        .collect()
}

/// One line: `State Recv-Q Send-Q Local:Port Peer:Port [users:((...))]`.
pub fn parse_ss_line(line: &str, protocol: Protocol) -> Option<SocketRecord> {
    let mut cols = line.split_whitespace();
    let state = cols.next()?;
    let _recv_q = cols.next()?;
    let _send_q = cols.next()?;
    let local = parse_ss_addr(cols.next()?)?;
    let peer = parse_ss_addr(cols.next()?)?;
    let process: Vec<&str> = cols.collect();

    let tcp_state = match protocol {
        Protocol::Tcp => Some(TcpState::from_ss(state)?),
        Protocol::Udp => None,
    };

    Some(SocketRecord {
        protocol,
        local,
        remote: Some(peer),
        pid: process.iter().find_map(|p| parse_ss_pid(p)),
        tcp_state,
    })
}

/// `1.2.3.4:80`, `[2001:db8::1]:443`, `*:68`, `0.0.0.0:*`,
/// `192.168.1.5%wlan0:68`, `[fe80::1]%eth0:546`.
fn parse_ss_addr(s: &str) -> Option<SocketAddr> {
    let (host, port) = s.rsplit_once(':')?;
    let port: u16 = if port == "*" { 0 } else { port.parse().ok()? };

    let host = host.split('%').next()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    let ip: IpAddr = if host == "*" {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        host.parse().ok()?
    };
    Some(SocketAddr::new(ip, port))
}

/// First `pid=N` inside a `users:((...))` column.
fn parse_ss_pid(s: &str) -> Option<u32> {
    let start = s.find("pid=")? + 4;
    let digits: String = s[start..].chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

// ── Enumerator ────────────────────────────────────────────────────────────────

pub struct SocketEnumerator {
    sources: Vec<Box<dyn SocketSource>>,
    include_unknown_owner: bool,
}

impl SocketEnumerator {
    /// procfs first, `ss` second.
    pub fn new(include_unknown_owner: bool) -> Self {
        Self::with_sources(
            vec![Box::new(ProcfsSource), Box::new(SsSource)],
            include_unknown_owner,
        )
    }

    pub fn with_sources(sources: Vec<Box<dyn SocketSource>>, include_unknown_owner: bool) -> Self {
        Self {
            sources,
            include_unknown_owner,
        }
    }

    pub fn list_tcp(&self, pid: Option<u32>) -> Vec<SocketRecord> {
        self.list(Protocol::Tcp, pid)
    }

    pub fn list_udp(&self, pid: Option<u32>) -> Vec<SocketRecord> {
        self.list(Protocol::Udp, pid)
    }

    fn list(&self, protocol: Protocol, pid: Option<u32>) -> Vec<SocketRecord> {
        for source in &self.sources {
            let result = match protocol {
                Protocol::Tcp => source.tcp(),
                Protocol::Udp => source.udp(),
            };
            match result {
                Ok(records) => return self.filter(records, pid),
                Err(e) => {
                    tracing::debug!(source = source.name(), %protocol, error = %e, "socket source failed");
                }
            }
        }
        tracing::debug!(%protocol, "all socket sources failed");
        Vec::new()
    }

    fn filter(&self, records: Vec<SocketRecord>, pid: Option<u32>) -> Vec<SocketRecord> {
        let Some(pid) = pid else {
            return records;
        };
        records
            .into_iter()
            .filter(|r| match r.pid {
                Some(owner) => owner == pid,
                None => self.include_unknown_owner,
            })
            .collect()
    }
}

// ── Process lookup ────────────────────────────────────────────────────────────

/// Pids whose name matches `name`, case-insensitively and ignoring `.exe`.
///
/// Checks the kernel's short name (truncated to 15 bytes) and the basename
/// of argv[0], which is where Wine/Proton games show their real name.
pub fn find_process_ids(name: &str) -> Vec<u32> {
    let wanted = normalize_process_name(name);
    if wanted.is_empty() {
        return Vec::new();
    }

    let processes = match all_processes() {
        Ok(p) => p,
        Err(e) => {
            tracing::debug!(error = %e, "cannot list processes");
            return Vec::new();
        }
    };

    let mut pids = Vec::new();
    for process in processes.flatten() {
        let Ok(pid) = u32::try_from(process.pid()) else {
            continue;
        };
        let comm = process.stat().map(|s| s.comm).unwrap_or_default();
        let argv0 = process
            .cmdline()
            .ok()
            .and_then(|args| args.into_iter().next())
            .unwrap_or_default();
        if process_name_matches(&wanted, &comm, &argv0) {
            pids.push(pid);
        }
    }
    pids
}

fn normalize_process_name(name: &str) -> String {
    let name = name.trim().to_ascii_lowercase();
    match name.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => name,
    }
}

/// Kernel comm names are cut at 15 bytes.
const COMM_LEN: usize = 15;

fn process_name_matches(wanted: &str, comm: &str, argv0: &str) -> bool {
    let comm = normalize_process_name(comm);
    if !comm.is_empty() {
        if comm == wanted {
            return true;
        }
        if comm.len() == COMM_LEN && wanted.starts_with(&comm) {
            return true;
        }
    }

    let base = argv0.rsplit(['/', '\\']).next().unwrap_or_default();
    !base.is_empty() && normalize_process_name(base) == wanted
}
