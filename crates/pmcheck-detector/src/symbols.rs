//! Instruction pointer to source line lookup for diagnostics.
//!
//! Resolution is best effort: a resolver that cannot answer returns
//! `None` and the diagnostic is printed with the raw address only.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Command;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

impl SourceLocation {
    /// Parse one `addr2line` output line (`file:line` or
    /// `file:line (discriminator N)`).  `??:0` and `??:?` mean unknown.
    pub fn parse_addr2line(text: &str) -> Option<Self> {
        let text = text.trim();
        let text = text.split(" (").next().unwrap_or(text);
        let (file, line) = text.rsplit_once(':')?;
        if file.is_empty() || file == "??" {
            return None;
        }
        let line: u32 = line.parse().ok()?;
        if line == 0 {
            return None;
        }
        Some(Self {
            file: file.to_string(),
            line,
        })
    }
}

/// Maps instruction pointers to source locations.
pub trait SymbolResolver {
    fn resolve(&self, ip: u64) -> Option<SourceLocation>;
}

/// Resolver that never resolves anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSymbols;

impl SymbolResolver for NoSymbols {
    fn resolve(&self, _ip: u64) -> Option<SourceLocation> {
        None
    }
}

/// Resolves through the `addr2line` tool against one executable.
/// Answers (including misses) are cached per address.
#[derive(Debug)]
pub struct Addr2Line {
    program: String,
    executable: PathBuf,
    cache: RefCell<HashMap<u64, Option<SourceLocation>>>,
}

impl Addr2Line {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            program: "addr2line".to_string(),
            executable: executable.into(),
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Use a different `addr2line` binary (e.g. a cross toolchain's).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn lookup(&self, ip: u64) -> Option<SourceLocation> {
        let output = Command::new(&self.program)
            .arg("-e")
            .arg(&self.executable)
            .arg(format!("{:#x}", ip))
            .output();
        match output {
            Ok(out) if out.status.success() => {
                let text = String::from_utf8_lossy(&out.stdout);
                let loc = text.lines().next().and_then(SourceLocation::parse_addr2line);
                debug!("addr2line {:#x} -> {:?}", ip, loc);
                loc
            }
            Ok(out) => {
                debug!("addr2line {:#x} exited with {}", ip, out.status);
                None
            }
            Err(e) => {
                warn!("failed to run {}: {}", self.program, e);
                None
            }
        }
    }
}

impl SymbolResolver for Addr2Line {
    fn resolve(&self, ip: u64) -> Option<SourceLocation> {
        if let Some(hit) = self.cache.borrow().get(&ip) {
            return hit.clone();
        }
        let loc = self.lookup(ip);
        self.cache.borrow_mut().insert(ip, loc.clone());
        loc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_addr2line_output() {
        assert_eq!(
            SourceLocation::parse_addr2line("/src/btree.c:214\n"),
            Some(SourceLocation {
                file: "/src/btree.c".into(),
                line: 214
            })
        );
        assert_eq!(
            SourceLocation::parse_addr2line("/src/a.c:7 (discriminator 2)"),
            Some(SourceLocation {
                file: "/src/a.c".into(),
                line: 7
            })
        );
        assert_eq!(SourceLocation::parse_addr2line("??:0"), None);
        assert_eq!(SourceLocation::parse_addr2line("??:?"), None);
    }

    #[test]
    fn missing_tool_resolves_to_none_and_is_cached() {
        let r = Addr2Line::new("/nonexistent/exe").with_program("/nonexistent/addr2line");
        assert_eq!(r.resolve(0x401000), None);
        assert_eq!(r.cache.borrow().len(), 1);
        assert_eq!(r.resolve(0x401000), None);
    }

    #[test]
    fn no_symbols_never_resolves() {
        assert_eq!(NoSymbols.resolve(0x1234), None);
    }
}
