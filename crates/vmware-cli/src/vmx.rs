use std::path::Path;

use crate::Result;

/// Settings that keep the system disk persistent and removable media detached.
const PERSISTENCE_FIXES: &[(&str, &str)] = &[
    ("scsi0:0.mode", "independent-persistent"),
    ("scsi0:0.redo", ""),
    ("scsi0:0.writeThrough", "TRUE"),
    ("ide1:0.present", "FALSE"),
    ("ide1:0.startConnected", "FALSE"),
    ("ide1:0.deviceType", "cdrom-raw"),
    ("ide1:0.fileName", ""),
    ("sata0:1.present", "FALSE"),
    ("sata0:1.startConnected", "FALSE"),
    ("ide0:1.present", "FALSE"),
    ("ide0:1.startConnected", "FALSE"),
    ("ide0:1.deviceType", "cdrom-raw"),
    ("ide0:1.fileName", ""),
    ("bios.bootOrder", "hdd,cdrom"),
];

const REMOVABLE_MEDIA: &[&str] = &["ide1:0", "sata0:1", "ide0:1"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    /// `key = "value"`. `raw` holds the original text until the entry is rewritten.
    Entry {
        key: String,
        value: String,
        raw: Option<String>,
    },
    /// Comments, blank lines and anything without `=`.
    Other(String),
}

/// A `.vmx` machine definition: `key = "value"` lines.
///
/// Keys are matched case-insensitively. Lines that are never written keep
/// their original text byte for byte.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmxFile {
    lines: Vec<Line>,
}

impl VmxFile {
    pub fn parse(text: &str) -> Self {
        let lines = text
            .lines()
            .map(|line| {
                let trimmed = line.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    return Line::Other(line.to_string());
                }
                match trimmed.split_once('=') {
                    Some((key, value)) => Line::Entry {
                        key: key.trim().to_string(),
                        value: unquote(value.trim()).to_string(),
                        raw: Some(line.to_string()),
                    },
                    None => Line::Other(line.to_string()),
                }
            })
            .collect();
        Self { lines }
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        Ok(Self::parse(&String::from_utf8_lossy(&bytes)))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        tokio::fs::write(path, self.render()).await?;
        Ok(())
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Entry { raw: Some(raw), .. } | Line::Other(raw) => out.push_str(raw),
                Line::Entry { key, value, raw: None } => {
                    out.push_str(&format!("{key} = \"{value}\""));
                }
            }
            out.push('\n');
        }
        out
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| match line {
            Line::Entry { key: k, value, .. } if k.eq_ignore_ascii_case(key) => {
                Some(value.as_str())
            }
            _ => None,
        })
    }

    /// Parse a numeric setting, falling back to `default` when absent or malformed.
    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Replace the first entry for `key` in place (dropping later duplicates),
    /// or append one. Returns whether the file changed.
    pub fn set(&mut self, key: &str, value: &str) -> bool {
        let mut changed = false;
        let mut seen = false;

        self.lines.retain_mut(|line| {
            let Line::Entry { key: k, value: v, raw } = line else {
                return true;
            };
            if !k.eq_ignore_ascii_case(key) {
                return true;
            }
            if seen {
                changed = true;
                return false;
            }
            seen = true;
            if v.as_str() != value {
                *v = value.to_string();
                *raw = None;
                changed = true;
            }
            true
        });

        if !seen {
            self.lines.push(Line::Entry {
                key: key.to_string(),
                value: value.to_string(),
                raw: None,
            });
            changed = true;
        }
        changed
    }

    pub fn guest_os(&self) -> Option<&str> {
        self.get("guestOS")
    }

    /// Force a persistent system disk, detach removable media and boot from disk first.
    pub fn apply_persistence_fixes(&mut self) -> bool {
        let mut changed = false;
        for (key, value) in PERSISTENCE_FIXES {
            changed |= self.set(key, value);
        }
        changed
    }

    /// Human-readable problems `apply_persistence_fixes` would correct.
    pub fn persistence_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();

        match self.get("scsi0:0.mode") {
            Some("independent-persistent") => {}
            mode => issues.push(format!(
                "disk mode is {:?}, expected \"independent-persistent\"",
                mode.unwrap_or("persistent")
            )),
        }
        if let Some(redo) = self.get("scsi0:0.redo").filter(|r| !r.is_empty()) {
            issues.push(format!("redo log is set to {redo:?}"));
        }
        for device in REMOVABLE_MEDIA {
            let present = self.get(&format!("{device}.present"));
            if present.is_some_and(|p| p.eq_ignore_ascii_case("TRUE")) {
                issues.push(format!("removable device {device} is connected"));
            }
        }
        match self.get("bios.bootOrder") {
            Some(order) if order.starts_with("hdd") => {}
            Some(order) => issues.push(format!("boot order is {order:?}, expected hdd first")),
            None => issues.push("boot order is unset".to_string()),
        }
        issues
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}
