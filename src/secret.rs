//! C3: the secret manager — conditional disclosure and the N+1 Merkle
//! secret tree for partial fills (spec §4.4).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::RngCore;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::hashing::{keccak, secret_hash, MerkleTree};
use crate::types::OrderHash;

#[derive(Debug, Clone)]
pub struct SecretRecord {
    pub order_hash: OrderHash,
    pub secret: String,
    pub secret_hash: [u8; 32],
    pub maker_address: String,
    pub stored_at: DateTime<Utc>,
    pub shared_at: Option<DateTime<Utc>>,
    pub shared_with: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FinalityState {
    pub order_hash: Option<OrderHash>,
    pub src_finalized: bool,
    pub dst_finalized: bool,
    pub src_finality_time: Option<DateTime<Utc>>,
    pub dst_finality_time: Option<DateTime<Utc>>,
    pub both_finalized_at: Option<DateTime<Utc>>,
}

/// `CreateMerkleSecretTree(orderHash, N)` output (spec §3, §4.4).
#[derive(Clone)]
pub struct MerkleSecretTree {
    /// `S[0..N]`, one extra secret beyond `N` parts for the 100%-fill case.
    pub secrets: Vec<[u8; 32]>,
    pub hashes: Vec<[u8; 32]>,
    tree: MerkleTree,
    pub used_secrets: HashSet<usize>,
    pub fill_progress: HashMap<String, u64>,
}

impl std::fmt::Debug for MerkleSecretTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MerkleSecretTree")
            .field("n_secrets", &self.secrets.len())
            .field("root", &hex::encode(self.tree.root()))
            .field("used_secrets", &self.used_secrets)
            .finish()
    }
}

impl MerkleSecretTree {
    pub fn root(&self) -> [u8; 32] {
        self.tree.root()
    }

    pub fn proof(&self, index: usize) -> Vec<[u8; 32]> {
        self.tree.proof(index)
    }

    /// Secret index for a given cumulative fill percentage in basis points
    /// (spec §3 invariant 9, §4.6): `min(floor(p * N / 10000), N)`.
    pub fn index_for_fill_bps(total_parts: u32, fill_bps: u64) -> usize {
        let n = u64::from(total_parts);
        let idx = fill_bps.saturating_mul(n) / 10_000;
        idx.min(n) as usize
    }
}

#[derive(Debug, Clone)]
pub enum SecretEvent {
    Shared { order_hash: OrderHash },
    PartialRevealed { order_hash: OrderHash, resolver_id: String, index: usize },
}

/// C3. Secrets, finality tracking, and Merkle trees each live behind their
/// own single-writer lock (spec §5).
pub struct SecretManager {
    config: CoordinatorConfig,
    secrets: RwLock<HashMap<OrderHash, SecretRecord>>,
    finality: RwLock<HashMap<OrderHash, FinalityState>>,
    merkle_trees: RwLock<HashMap<OrderHash, MerkleSecretTree>>,
    events: broadcast::Sender<SecretEvent>,
    release_handles: RwLock<HashMap<OrderHash, JoinHandle<()>>>,
}

impl SecretManager {
    pub fn new(config: CoordinatorConfig) -> Arc<Self> {
        let (events, _rx) = broadcast::channel(100);
        Arc::new(Self {
            config,
            secrets: RwLock::new(HashMap::new()),
            finality: RwLock::new(HashMap::new()),
            merkle_trees: RwLock::new(HashMap::new()),
            events,
            release_handles: RwLock::new(HashMap::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SecretEvent> {
        self.events.subscribe()
    }

    /// `StoreSecret(orderHash, secret, maker)` (spec §4.4): idempotent on
    /// a matching value, rejects a conflicting one.
    pub async fn store_secret(
        &self,
        order_hash: &OrderHash,
        secret: String,
        maker_address: String,
        expected_hash: [u8; 32],
    ) -> CoordinatorResult<()> {
        let computed = secret_hash(&secret);
        if computed != expected_hash {
            return Err(CoordinatorError::SecretConflict {
                order_hash: order_hash.0.clone(),
            });
        }

        let mut secrets = self.secrets.write().await;
        if let Some(existing) = secrets.get(order_hash) {
            if existing.secret == secret {
                return Ok(());
            }
            return Err(CoordinatorError::SecretConflict {
                order_hash: order_hash.0.clone(),
            });
        }
        secrets.insert(
            order_hash.clone(),
            SecretRecord {
                order_hash: order_hash.clone(),
                secret,
                secret_hash: computed,
                maker_address,
                stored_at: Utc::now(),
                shared_at: None,
                shared_with: Vec::new(),
            },
        );
        Ok(())
    }

    /// `UpdateFinalityStatus(orderHash, srcFinalized, dstFinalized)` (spec
    /// §4.4): each bool only transitions false -> true; once both are
    /// true, schedules release `finalityLockDuration` later.
    pub async fn update_finality_status(
        self: &Arc<Self>,
        order_hash: &OrderHash,
        src_finalized: bool,
        dst_finalized: bool,
        resolver_ids: Vec<String>,
    ) -> CoordinatorResult<()> {
        let should_schedule = {
            let mut finality = self.finality.write().await;
            let entry = finality.entry(order_hash.clone()).or_insert_with(|| FinalityState {
                order_hash: Some(order_hash.clone()),
                ..Default::default()
            });
            let now = Utc::now();
            if src_finalized && !entry.src_finalized {
                entry.src_finalized = true;
                entry.src_finality_time = Some(now);
            }
            if dst_finalized && !entry.dst_finalized {
                entry.dst_finalized = true;
                entry.dst_finality_time = Some(now);
            }
            if entry.src_finalized && entry.dst_finalized && entry.both_finalized_at.is_none() {
                entry.both_finalized_at = Some(now);
                true
            } else {
                false
            }
        };

        if should_schedule {
            let this = Arc::clone(self);
            let order_hash = order_hash.clone();
            let delay = self.config.finality_lock_duration;
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = this.release_secret(&order_hash, resolver_ids).await;
            });
            self.release_handles.write().await.insert(order_hash.clone(), handle);
            info!(%order_hash, "both chains finalized, secret release scheduled");
        }
        Ok(())
    }

    pub async fn get_finality(&self, order_hash: &OrderHash) -> Option<FinalityState> {
        self.finality.read().await.get(order_hash).cloned()
    }

    /// Releases the secret iff both a stored secret and finality exist
    /// (spec §4.4 "On release"). This is the only path that ever reveals a
    /// secret; it is never called before the finality-lock sleep elapses
    /// (spec §8 invariant 2, "Secret safety").
    async fn release_secret(&self, order_hash: &OrderHash, resolver_ids: Vec<String>) -> CoordinatorResult<()> {
        let mut secrets = self.secrets.write().await;
        let record = match secrets.get_mut(order_hash) {
            Some(r) => r,
            None => return Ok(()),
        };
        if record.shared_at.is_none() {
            record.shared_at = Some(Utc::now());
            record.shared_with = resolver_ids;
            let _ = self.events.send(SecretEvent::Shared {
                order_hash: order_hash.clone(),
            });
            info!(%order_hash, "secret shared");
        }
        Ok(())
    }

    /// Any call that would disclose a secret before both escrows are
    /// finalized AND the finality lock has elapsed fails with
    /// `FinalityNotReached` (spec §4.4 "Anti-frontrunning property").
    pub async fn reveal_secret(&self, order_hash: &OrderHash) -> CoordinatorResult<String> {
        let secrets = self.secrets.read().await;
        let record = secrets.get(order_hash).ok_or_else(|| CoordinatorError::NotFound {
            order_hash: order_hash.0.clone(),
        })?;
        if record.shared_at.is_none() {
            return Err(CoordinatorError::FinalityNotReached {
                order_hash: order_hash.0.clone(),
            });
        }
        Ok(record.secret.clone())
    }

    /// `CreateMerkleSecretTree(orderHash, N)` (spec §4.4): N+1
    /// cryptographically random secrets; determinism is not required,
    /// unpredictability is (uses `rand`'s OS-seeded thread RNG).
    pub async fn create_merkle_secret_tree(&self, order_hash: OrderHash, n: u32) -> MerkleSecretTree {
        let mut rng = rand::thread_rng();
        let mut secrets = Vec::with_capacity(n as usize + 1);
        let mut hashes = Vec::with_capacity(n as usize + 1);
        for _ in 0..=n {
            let mut secret = [0u8; 32];
            rng.fill_bytes(&mut secret);
            let h = keccak(&secret);
            secrets.push(secret);
            hashes.push(h);
        }
        let tree = MerkleTree::build(&hashes);
        let merkle = MerkleSecretTree {
            secrets,
            hashes,
            tree,
            used_secrets: HashSet::new(),
            fill_progress: HashMap::new(),
        };
        self.merkle_trees.write().await.insert(order_hash, merkle.clone());
        merkle
    }

    pub async fn get_merkle_tree(&self, order_hash: &OrderHash) -> Option<MerkleSecretTree> {
        self.merkle_trees.read().await.get(order_hash).cloned()
    }

    /// `(stored, shared)` totals for `Stats()` (spec §6).
    pub async fn counts(&self) -> (usize, usize) {
        let secrets = self.secrets.read().await;
        let shared = secrets.values().filter(|s| s.shared_at.is_some()).count();
        (secrets.len(), shared)
    }

    /// `RevealPartialSecret(orderHash, resolverId, fillPercentage)` (spec
    /// §4.4): returns `S[floor(fillPercentage * N / 100)]` clamped to N,
    /// marks that index used, records fill progress.
    pub async fn reveal_partial_secret(
        &self,
        order_hash: &OrderHash,
        resolver_id: &str,
        total_parts: u32,
        fill_percentage: u64,
    ) -> CoordinatorResult<(usize, [u8; 32])> {
        let mut trees = self.merkle_trees.write().await;
        let tree = trees.get_mut(order_hash).ok_or_else(|| CoordinatorError::NotFound {
            order_hash: order_hash.0.clone(),
        })?;
        let fill_bps = fill_percentage.saturating_mul(100);
        let index = MerkleSecretTree::index_for_fill_bps(total_parts, fill_bps);
        tree.used_secrets.insert(index);
        tree.fill_progress.insert(resolver_id.to_string(), fill_percentage);
        let secret = tree.secrets[index];
        let _ = self.events.send(SecretEvent::PartialRevealed {
            order_hash: order_hash.clone(),
            resolver_id: resolver_id.to_string(),
            index,
        });
        Ok((index, secret))
    }
}

impl Clone for MerkleSecretTree {
    fn clone(&self) -> Self {
        Self {
            secrets: self.secrets.clone(),
            hashes: self.hashes.clone(),
            tree: self.tree.clone(),
            used_secrets: self.used_secrets.clone(),
            fill_progress: self.fill_progress.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_secret_is_idempotent_on_same_value() {
        let mgr = SecretManager::new(CoordinatorConfig::default());
        let hash = OrderHash("0xabc".into());
        let expected = secret_hash("shh");
        mgr.store_secret(&hash, "shh".into(), "maker".into(), expected)
            .await
            .unwrap();
        mgr.store_secret(&hash, "shh".into(), "maker".into(), expected)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn store_secret_rejects_conflicting_value() {
        let mgr = SecretManager::new(CoordinatorConfig::default());
        let hash = OrderHash("0xabc".into());
        let expected = secret_hash("shh");
        mgr.store_secret(&hash, "shh".into(), "maker".into(), expected)
            .await
            .unwrap();
        let err = mgr
            .store_secret(&hash, "other".into(), "maker".into(), expected)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::SecretConflict { .. }));
    }

    #[tokio::test]
    async fn store_secret_rejects_hash_mismatch() {
        let mgr = SecretManager::new(CoordinatorConfig::default());
        let hash = OrderHash("0xabc".into());
        let wrong_expected = secret_hash("not-the-secret");
        let err = mgr
            .store_secret(&hash, "shh".into(), "maker".into(), wrong_expected)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::SecretConflict { .. }));
    }

    #[tokio::test]
    async fn reveal_fails_before_finality_lock_elapses() {
        let mgr = SecretManager::new(CoordinatorConfig {
            finality_lock_duration: std::time::Duration::from_millis(50),
            ..CoordinatorConfig::default()
        });
        let hash = OrderHash("0xabc".into());
        let expected = secret_hash("shh");
        mgr.store_secret(&hash, "shh".into(), "maker".into(), expected)
            .await
            .unwrap();
        mgr.update_finality_status(&hash, true, true, vec!["r1".into()])
            .await
            .unwrap();

        let err = mgr.reveal_secret(&hash).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::FinalityNotReached { .. }));

        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        let secret = mgr.reveal_secret(&hash).await.unwrap();
        assert_eq!(secret, "shh");
    }

    #[tokio::test]
    async fn finality_booleans_are_monotonic() {
        let mgr = SecretManager::new(CoordinatorConfig::default());
        let hash = OrderHash("0xabc".into());
        mgr.update_finality_status(&hash, true, false, vec![]).await.unwrap();
        let s1 = mgr.get_finality(&hash).await.unwrap();
        assert!(s1.src_finalized && !s1.dst_finalized && s1.both_finalized_at.is_none());

        mgr.update_finality_status(&hash, false, false, vec![]).await.unwrap();
        let s2 = mgr.get_finality(&hash).await.unwrap();
        assert_eq!(s1.src_finality_time, s2.src_finality_time);
    }

    #[tokio::test]
    async fn partial_secret_index_matches_spec_example() {
        let mgr = SecretManager::new(CoordinatorConfig::default());
        let hash = OrderHash("0xabc".into());
        mgr.create_merkle_secret_tree(hash.clone(), 4).await;

        let (idx, _) = mgr.reveal_partial_secret(&hash, "r1", 4, 25).await.unwrap();
        assert_eq!(idx, 1);
        let (idx, _) = mgr.reveal_partial_secret(&hash, "r2", 4, 100).await.unwrap();
        assert_eq!(idx, 4);

        let tree = mgr.get_merkle_tree(&hash).await.unwrap();
        assert!(tree.used_secrets.contains(&1));
        assert!(tree.used_secrets.contains(&4));
    }
}
