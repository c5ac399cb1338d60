// ── Hosts-file mapping ──
//
// The manager's server name resolves through the device hosts file. Only
// the line carrying that name is ever rewritten; every other line is kept
// verbatim. Oversized or malformed files are refused, never repaired.

use std::fs;
use std::io::{ErrorKind, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::info;

use crate::error::CoreError;

/// Most lines a hosts file may hold before it is refused.
pub const MAX_LINES: usize = 128;

const LOOPBACK: [&str; 2] = ["127.0.0.1", "::1"];

fn hosts_err(message: impl Into<String>) -> CoreError {
    CoreError::Hosts {
        message: message.into(),
    }
}

/// One significant line: an address and its names.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Mapping {
    ip: IpAddr,
    names: Vec<String>,
    /// Original text while the line is unmodified.
    raw: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    /// Blank or comment, kept as written.
    Verbatim(String),
    Mapping(Mapping),
}

fn parse_line(raw: &str, number: usize) -> Result<Line, CoreError> {
    let content = raw.split('#').next().unwrap_or_default().trim();
    if content.is_empty() {
        return Ok(Line::Verbatim(raw.to_owned()));
    }
    let mut fields = content.split_whitespace();
    let ip = fields
        .next()
        .and_then(|f| f.parse::<IpAddr>().ok())
        .ok_or_else(|| hosts_err(format!("line {number}: invalid address")))?;
    let names: Vec<String> = fields.map(str::to_owned).collect();
    if names.is_empty() {
        return Err(hosts_err(format!("line {number}: address without a name")));
    }
    Ok(Line::Mapping(Mapping {
        ip,
        names,
        raw: Some(raw.to_owned()),
    }))
}

fn render(lines: &[Line]) -> String {
    let mut out = String::new();
    for line in lines {
        match line {
            Line::Verbatim(raw)
            | Line::Mapping(Mapping {
                raw: Some(raw), ..
            }) => out.push_str(raw),
            Line::Mapping(m) => {
                out.push_str(&m.ip.to_string());
                for name in &m.names {
                    out.push(' ');
                    out.push_str(name);
                }
            }
        }
        out.push('\n');
    }
    out
}

/// Drop `name` from every mapping, removing mappings left without names.
fn remove_name(lines: &mut Vec<Line>, name: &str) -> bool {
    let mut changed = false;
    lines.retain_mut(|line| match line {
        Line::Verbatim(_) => true,
        Line::Mapping(m) => {
            let before = m.names.len();
            m.names.retain(|n| n != name);
            if m.names.len() != before {
                m.raw = None;
                changed = true;
            }
            !m.names.is_empty()
        }
    });
    changed
}

// ── HostsFile ────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct HostsFile {
    path: PathBuf,
    write: Mutex<()>,
}

impl HostsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Vec<Line>, CoreError> {
        match fs::symlink_metadata(&self.path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(hosts_err(format!("{} is a symlink", self.path.display())));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            _ => {}
        }
        let raw = fs::read_to_string(&self.path)
            .map_err(|e| hosts_err(format!("{}: {e}", self.path.display())))?;
        let count = raw.lines().count();
        if count > MAX_LINES {
            return Err(hosts_err(format!("{count} lines, limit {MAX_LINES}")));
        }
        raw.lines()
            .enumerate()
            .map(|(i, l)| parse_line(l, i + 1))
            .collect()
    }

    fn write(&self, lines: &[Line]) -> Result<(), CoreError> {
        if lines.len() > MAX_LINES {
            return Err(hosts_err(format!("{} lines, limit {MAX_LINES}", lines.len())));
        }
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(render(lines).as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(fs::Permissions::from_mode(0o644))?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| CoreError::Io(e.error))?;
        Ok(())
    }

    /// Address `name` currently resolves to.
    pub fn lookup(&self, name: &str) -> Result<Option<IpAddr>, CoreError> {
        Ok(self.read()?.into_iter().find_map(|line| match line {
            Line::Mapping(m) if m.names.iter().any(|n| n == name) => Some(m.ip),
            _ => None,
        }))
    }

    /// Every name mapped to `ip`.
    pub fn aliases_of(&self, ip: &str) -> Result<Vec<String>, CoreError> {
        let mut out = Vec::new();
        for line in self.read()? {
            if let Line::Mapping(m) = line {
                if m.ip.to_string() == ip {
                    out.extend(m.names);
                }
            }
        }
        Ok(out)
    }

    /// Whether `name` is a local alias of the loopback address.
    ///
    /// An unreadable file counts as yes, so a name is never accepted
    /// without the check having run.
    pub fn is_loopback_alias(&self, name: &str) -> bool {
        LOOPBACK.iter().any(|ip| match self.aliases_of(ip) {
            Ok(names) => names.iter().any(|n| n == name),
            Err(e) => {
                tracing::error!(error = %e, "hosts file unreadable, refusing name");
                true
            }
        })
    }

    /// Map `name` to `ip`, replacing any previous mapping of that name.
    pub fn set(&self, ip: IpAddr, name: &str) -> Result<(), CoreError> {
        let _guard = self.write.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut lines = self.read()?;
        let current = lines.iter().any(|l| {
            matches!(l, Line::Mapping(m) if m.ip == ip && m.names.len() == 1 && m.names[0] == name)
        });
        if current {
            return Ok(());
        }
        remove_name(&mut lines, name);
        lines.push(Line::Mapping(Mapping {
            ip,
            names: vec![name.to_owned()],
            raw: None,
        }));
        self.write(&lines)?;
        info!(%ip, name, "hosts entry updated");
        Ok(())
    }

    /// Remove every mapping of `name`.
    pub fn clear(&self, name: &str) -> Result<(), CoreError> {
        let _guard = self.write.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut lines = self.read()?;
        if remove_name(&mut lines, name) {
            self.write(&lines)?;
            info!(name, "hosts entry cleared");
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const BASE: &str = "127.0.0.1 localhost my-box\n::1 localhost6\n# managed\n\n10.0.0.5 other.test\n";

    fn hosts(content: &str) -> (tempfile::TempDir, HostsFile) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        fs::write(&path, content).unwrap();
        (dir, HostsFile::new(path))
    }

    #[test]
    fn set_replaces_previous_mapping_and_keeps_the_rest() {
        let (_dir, file) = hosts(BASE);
        let ip: IpAddr = "10.0.0.8".parse().unwrap();
        file.set(ip, "fd.example.test").unwrap();
        file.set("10.0.0.9".parse().unwrap(), "fd.example.test").unwrap();

        assert_eq!(
            file.lookup("fd.example.test").unwrap(),
            Some("10.0.0.9".parse().unwrap())
        );
        let text = fs::read_to_string(file.path()).unwrap();
        assert!(text.starts_with("127.0.0.1 localhost my-box\n::1 localhost6\n# managed\n\n"));
        assert_eq!(text.matches("fd.example.test").count(), 1);
    }

    #[test]
    fn clear_removes_only_that_name() {
        let (_dir, file) = hosts("10.0.0.8 fd.example.test alias.test\n");
        file.clear("fd.example.test").unwrap();
        assert_eq!(file.lookup("fd.example.test").unwrap(), None);
        assert!(file.lookup("alias.test").unwrap().is_some());
        file.clear("alias.test").unwrap();
        assert_eq!(fs::read_to_string(file.path()).unwrap(), "");
    }

    #[test]
    fn loopback_aliases() {
        let (_dir, file) = hosts(BASE);
        assert!(file.is_loopback_alias("my-box"));
        assert!(file.is_loopback_alias("localhost6"));
        assert!(!file.is_loopback_alias("other.test"));
    }

    #[test]
    fn malformed_file_is_refused_untouched() {
        let (_dir, file) = hosts("not-an-ip name\n");
        assert!(matches!(
            file.set("10.0.0.8".parse().unwrap(), "fd.example.test"),
            Err(CoreError::Hosts { .. })
        ));
        assert_eq!(fs::read_to_string(file.path()).unwrap(), "not-an-ip name\n");
        assert!(file.is_loopback_alias("anything"));
    }

    #[test]
    fn oversized_file_is_refused() {
        let content: String = (0..=MAX_LINES).map(|i| format!("10.1.0.{} h{i}\n", i % 250)).collect();
        let (_dir, file) = hosts(&content);
        assert!(file.lookup("h1").is_err());
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let file = HostsFile::new(dir.path().join("hosts"));
        assert_eq!(file.lookup("x").unwrap(), None);
        file.set("10.0.0.8".parse().unwrap(), "fd.example.test").unwrap();
        assert!(file.lookup("fd.example.test").unwrap().is_some());
    }
}
