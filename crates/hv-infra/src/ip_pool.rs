use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::IpPoolConfig;
use crate::{Error, Result};

const USED_MARK: &str = "used";

/// Fixed-range IPv4 lease pool shared by every provider.
///
/// Leases live in memory behind a mutex; the critical section only flips
/// flags. After each mutation the whole pool is written to a text file, one
/// address per line with `# used [owner]` appended to leased ones, which
/// is reloaded on the next start.
pub struct IpLeasePool {
    prefix: String,
    start: u8,
    end: u8,
    state: Mutex<PoolState>,
    file: Option<PathBuf>,
    /// Generation last written to `file`, so a stale snapshot never overwrites a newer one.
    written: Mutex<u64>,
}

#[derive(Debug, Clone)]
struct PoolState {
    /// Owner tag per address; `None` means free.
    slots: Vec<Option<String>>,
    generation: u64,
}

struct Snapshot {
    generation: u64,
    text: String,
}

impl IpLeasePool {
    /// A pool with no durable file.
    pub fn in_memory(prefix: impl Into<String>, start: u8, end: u8) -> Result<Self> {
        Self::build(prefix.into(), start, end, None)
    }

    /// Load leases from `config.file`, creating the file when absent.
    pub async fn load_or_init(config: &IpPoolConfig) -> Result<Self> {
        let pool = Self::build(
            config.prefix.clone(),
            config.start,
            config.end,
            Some(config.file.clone()),
        )?;

        match tokio::fs::read_to_string(&config.file).await {
            Ok(text) => {
                let mut state = pool.state.lock().await;
                for (addr, owner) in parse_leases(&text) {
                    if let Some(i) = pool.index_of(addr) {
                        state.slots[i] = Some(owner.to_string());
                    }
                }
                let leased = state.slots.iter().filter(|s| s.is_some()).count();
                drop(state);
                info!(file = %config.file.display(), leased, "ip pool loaded");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => pool.initialize().await?,
            Err(e) => return Err(e.into()),
        }
        Ok(pool)
    }

    fn build(prefix: String, start: u8, end: u8, file: Option<PathBuf>) -> Result<Self> {
        if start > end {
            return Err(Error::Config(format!(
                "ip pool range {start}..={end} is empty"
            )));
        }
        let size = usize::from(end - start) + 1;
        Ok(Self {
            prefix,
            start,
            end,
            state: Mutex::new(PoolState {
                slots: vec![None; size],
                generation: 0,
            }),
            file,
            written: Mutex::new(0),
        })
    }

    /// Write the pool file if it does not exist yet. Existing leases are never reset.
    pub async fn initialize(&self) -> Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        if tokio::fs::try_exists(file).await? {
            return Ok(());
        }
        let snapshot = self.snapshot(&*self.state.lock().await);
        self.write(file, snapshot).await
    }

    /// Lease the lowest free address to `owner`.
    pub async fn allocate(&self, owner: &str) -> Result<String> {
        let (addr, snapshot) = {
            let mut state = self.state.lock().await;
            let Some(i) = state.slots.iter().position(Option::is_none) else {
                return Err(Error::ResourceExhausted(format!(
                    "no free address in {}.{}-{}",
                    self.prefix, self.start, self.end
                )));
            };
            state.slots[i] = Some(owner.to_string());
            state.generation += 1;
            (self.address(i), self.snapshot(&state))
        };

        debug!(ip = %addr, owner, "ip leased");
        self.persist(snapshot).await;
        Ok(addr)
    }

    /// Return an address to the pool. Returns whether it was leased.
    pub async fn release(&self, addr: &str) -> bool {
        let Some(i) = self.index_of(addr) else {
            return false;
        };
        let snapshot = {
            let mut state = self.state.lock().await;
            if state.slots[i].take().is_none() {
                return false;
            }
            state.generation += 1;
            self.snapshot(&state)
        };

        debug!(ip = %addr, "ip released");
        self.persist(snapshot).await;
        true
    }

    /// Release every address leased to `owner`.
    pub async fn release_owner(&self, owner: &str) -> Vec<String> {
        let (released, snapshot) = {
            let mut state = self.state.lock().await;
            let mut released = Vec::new();
            for (i, slot) in state.slots.iter_mut().enumerate() {
                if slot.as_deref() == Some(owner) {
                    *slot = None;
                    released.push(self.address(i));
                }
            }
            if released.is_empty() {
                return released;
            }
            state.generation += 1;
            (released, self.snapshot(&state))
        };

        self.persist(snapshot).await;
        released
    }

    pub async fn is_leased(&self, addr: &str) -> bool {
        match self.index_of(addr) {
            Some(i) => self.state.lock().await.slots[i].is_some(),
            None => false,
        }
    }

    pub async fn available(&self) -> usize {
        self.state
            .lock()
            .await
            .slots
            .iter()
            .filter(|s| s.is_none())
            .count()
    }

    fn address(&self, index: usize) -> String {
        format!("{}.{}", self.prefix, usize::from(self.start) + index)
    }

    fn index_of(&self, addr: &str) -> Option<usize> {
        let host = addr.strip_prefix(&self.prefix)?.strip_prefix('.')?;
        let host: u8 = host.parse().ok()?;
        (self.start..=self.end)
            .contains(&host)
            .then(|| usize::from(host - self.start))
    }

    fn snapshot(&self, state: &PoolState) -> Snapshot {
        let mut text = String::new();
        for (i, slot) in state.slots.iter().enumerate() {
            text.push_str(&self.address(i));
            match slot.as_deref() {
                Some("") => text.push_str(&format!(" # {USED_MARK}")),
                Some(owner) => text.push_str(&format!(" # {USED_MARK} {owner}")),
                None => {}
            }
            text.push('\n');
        }
        Snapshot {
            generation: state.generation,
            text,
        }
    }

    async fn persist(&self, snapshot: Snapshot) {
        let Some(file) = &self.file else {
            return;
        };
        if let Err(e) = self.write(file, snapshot).await {
            warn!(file = %file.display(), "failed to persist ip pool: {e}");
        }
    }

    async fn write(&self, file: &Path, snapshot: Snapshot) -> Result<()> {
        let mut written = self.written.lock().await;
        if snapshot.generation < *written {
            return Ok(());
        }
        tokio::fs::write(file, snapshot.text).await?;
        *written = snapshot.generation;
        Ok(())
    }
}

/// `(address, owner)` for every leased line of a pool file.
fn parse_leases(text: &str) -> impl Iterator<Item = (&str, &str)> {
    text.lines().filter_map(|line| {
        let (addr, mark) = line.split_once('#')?;
        let owner = mark.trim().strip_prefix(USED_MARK)?;
        Some((addr.trim(), owner.trim()))
    })
}
