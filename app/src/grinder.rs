use crate::actor::ActorId;
use crate::error::AuctionError;
use hsd_client::{ChainService, MAX_NAME_LENGTH};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::*;

const ALPHANUMERIC: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const NAME_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789-_";

/// Lowercase letters, digits, `-` and `_`, neither of the latter two at
/// either end.
pub fn is_valid_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_NAME_LENGTH {
        return false;
    }
    let edge_ok = |b: &u8| ALPHANUMERIC.contains(b);
    bytes.iter().all(|b| NAME_CHARSET.contains(b))
        && bytes.first().map_or(false, edge_ok)
        && bytes.last().map_or(false, edge_ok)
}

/// Deterministic candidate names, seeded by chain height.
#[derive(Debug, Clone)]
pub struct LocalGrinder {
    length: RangeInclusive<usize>,
}

impl LocalGrinder {
    pub fn new(length: RangeInclusive<usize>) -> Self {
        Self { length }
    }

    pub fn grind(&self, height: u64, salt: u64, attempt: u32) -> String {
        let seed = height
            .wrapping_mul(0x9e37_79b9_7f4a_7c15)
            .wrapping_add(salt.rotate_left(32))
            .wrapping_add(attempt as u64);
        let mut rng = StdRng::seed_from_u64(seed);
        let length = rng.gen_range(self.length.clone());
        (0..length)
            .map(|i| {
                let pool = if i == 0 || i + 1 == length {
                    ALPHANUMERIC
                } else {
                    NAME_CHARSET
                };
                pool[rng.gen_range(0..pool.len())] as char
            })
            .collect()
    }
}

/// Names held by running auctions and the actor running each.
#[derive(Clone, Default)]
pub struct ActiveNames {
    inner: Arc<Mutex<HashMap<String, ActorId>>>,
}

impl ActiveNames {
    pub fn try_reserve(&self, name: &str, actor: ActorId) -> Option<NameLease> {
        let mut names = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if names.contains_key(name) {
            return None;
        }
        names.insert(name.to_string(), actor);
        Some(NameLease {
            name: name.to_string(),
            names: self.clone(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn snapshot(&self) -> Vec<(String, ActorId)> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, actor)| (name.clone(), *actor))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive claim on an active name, released on drop.
#[derive(Debug)]
pub struct NameLease {
    name: String,
    names: ActiveNames,
}

impl NameLease {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NameLease {
    fn drop(&mut self) {
        self.names
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

impl std::fmt::Debug for ActiveNames {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveNames").field("len", &self.len()).finish()
    }
}

/// Picks unused names, locally when possible, otherwise through the node.
pub struct NameGrinder {
    local: Option<LocalGrinder>,
    length: RangeInclusive<usize>,
    attempts: u32,
}

impl NameGrinder {
    pub fn new(length: RangeInclusive<usize>, local: bool, attempts: u32) -> Self {
        Self {
            local: local.then(|| LocalGrinder::new(length.clone())),
            length,
            attempts,
        }
    }

    async fn candidate(
        &self,
        chain: &dyn ChainService,
        salt: u64,
        attempt: u32,
    ) -> Result<String, AuctionError> {
        if let Some(local) = &self.local {
            match chain.get_height().await {
                Ok(height) => return Ok(local.grind(height, salt, attempt)),
                Err(err) => debug!("Local grinder unavailable: {err}"),
            }
        }
        let length = rand::thread_rng().gen_range(self.length.clone());
        Ok(chain.grind_name(length).await?)
    }

    /// Reserves `name`, or a freshly ground one when `name` is `None`.
    pub async fn reserve(
        &self,
        chain: &dyn ChainService,
        names: &ActiveNames,
        actor: ActorId,
        name: Option<String>,
    ) -> Result<NameLease, AuctionError> {
        if let Some(name) = name {
            if !is_valid_name(&name) {
                return Err(AuctionError::Precondition("Invalid name."));
            }
            return names
                .try_reserve(&name, actor)
                .ok_or(AuctionError::NameInUse(name));
        }

        for attempt in 0..self.attempts {
            let candidate = self.candidate(chain, actor as u64, attempt).await?;
            if !is_valid_name(&candidate) {
                warn!("Discarding invalid candidate {candidate:?}");
                continue;
            }
            match names.try_reserve(&candidate, actor) {
                Some(lease) => return Ok(lease),
                None => debug!("Candidate {candidate} already active, grinding again"),
            }
        }
        Err(AuctionError::NamesExhausted(self.attempts))
    }
}
