//! The barrier: three-level hierarchical key encryption
//!
//! Unseal → Root → Intermediate → Content. Every level is an A256GCM
//! symmetric JWK; each key row's material is a compact JWE under the level
//! above, and root keys are wrapped by the unseal shared secret, which only
//! ever exists in memory.
//!
//! Callers see exactly two operations: [`Barrier::encrypt`] and
//! [`Barrier::decrypt`]. Ciphertexts are `kid:compact-jwe`, so any
//! historical content key with `valid_for_decrypt` still opens old
//! ciphertexts after any number of rotations.
//!
//! Rotation at a level serializes on that level's rotation guard, wraps a
//! fresh key under the active key one level up, inserts + flips `active` in
//! one repository transaction, then swaps the in-memory active key under a
//! brief exclusive lock. Lower levels are never rewrapped: their rows name
//! the wrapping kid in the JWE header, and unwrapping walks up the
//! hierarchy on demand.

pub mod unseal;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::config::BarrierConfig;
use crate::crypto::jwe;
use crate::crypto::jwk::{Jwk, KeyMaterial, KeyUse};
use crate::crypto::registry;
use crate::error::{BarrierError, CryptoError, Error, Result};
use crate::repository::{BarrierKeyKind, BarrierKeyRow, Repository};
use unseal::{SHARED_SECRET_KID, SHARED_SECRET_LEN};

const LEVEL_ENC: &str = "A256GCM";

/// In-memory keys for one level: the active key plus every unwrapped
/// historical key still valid for decryption.
struct Level {
    active_kid: String,
    keys: HashMap<String, Zeroizing<Vec<u8>>>,
}

impl Level {
    fn new(active_kid: String, key: Zeroizing<Vec<u8>>) -> Self {
        let mut keys = HashMap::new();
        keys.insert(active_kid.clone(), key);
        Self { active_kid, keys }
    }

    fn active_key(&self) -> Result<&Zeroizing<Vec<u8>>> {
        self.keys
            .get(&self.active_kid)
            .ok_or_else(|| Error::Barrier(BarrierError::Sealed))
    }
}

/// The unsealed barrier.
///
/// Constructing one *is* the unseal operation; a sealed barrier is the
/// absence of this value.
pub struct Barrier {
    repo: Arc<Repository>,
    shared_secret: Zeroizing<[u8; SHARED_SECRET_LEN]>,
    // Lock order is parent before child: root, then intermediate, then
    // content. Readers take the level shared; rotation swaps the active key
    // under a brief exclusive lock after the new row is committed.
    root: RwLock<Level>,
    intermediate: RwLock<Level>,
    content: RwLock<Level>,
    // One rotation at a time per level; a second concurrent attempt gets
    // ErrRotationInProgress instead of queueing.
    root_rotation: tokio::sync::Mutex<()>,
    intermediate_rotation: tokio::sync::Mutex<()>,
    content_rotation: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Barrier").finish_non_exhaustive()
    }
}

impl Barrier {
    /// Bootstrap from unseal shares.
    ///
    /// First start (no active root row) generates and persists fresh keys at
    /// all three levels; every later start unwraps the stored hierarchy. A
    /// wrong share combination surfaces as `ErrUnsealShareInvalid` before
    /// any partial state is exposed.
    pub async fn unseal(
        repo: Arc<Repository>,
        config: &BarrierConfig,
        service_name: &str,
    ) -> Result<Self> {
        let shared_secret = unseal::derive_shared_secret(&config.unseal, service_name)?;

        match repo.find_active_barrier_key(BarrierKeyKind::RootKey).await? {
            Some(root_row) => {
                Self::load_existing(repo, shared_secret, root_row).await
            }
            None => Self::first_start(repo, shared_secret).await,
        }
    }

    async fn load_existing(
        repo: Arc<Repository>,
        shared_secret: Zeroizing<[u8; SHARED_SECRET_LEN]>,
        root_row: BarrierKeyRow,
    ) -> Result<Self> {
        let root_key = unwrap_level_key(&shared_secret[..], &root_row.wrapped_material)
            .map_err(|_| Error::Barrier(BarrierError::UnsealShareInvalid))?;
        let mut roots = Level::new(root_row.kid.clone(), root_key);

        // The active intermediate may still be wrapped by a retired root, and
        // the active content key by a retired intermediate: rotation never
        // rewraps downward. Walk whatever the headers name, caching each
        // unwrapped ancestor.
        let intermediate_row = repo
            .find_active_barrier_key(BarrierKeyKind::IntermediateKey)
            .await?
            .ok_or(Error::Barrier(BarrierError::Sealed))?;
        let parent_kid = jwe::peek_header(&intermediate_row.wrapped_material)?.kid;
        if !roots.keys.contains_key(&parent_kid) {
            let row = repo
                .find_barrier_key(BarrierKeyKind::RootKey, &parent_kid)
                .await?
                .filter(|r| r.valid_for_decrypt)
                .ok_or_else(|| Error::Crypto(CryptoError::UnknownKid(parent_kid.clone())))?;
            let key = unwrap_level_key(&shared_secret[..], &row.wrapped_material)
                .map_err(|_| Error::Barrier(BarrierError::UnsealShareInvalid))?;
            roots.keys.insert(parent_kid.clone(), key);
        }
        let intermediate_key =
            unwrap_level_key(&roots.keys[&parent_kid], &intermediate_row.wrapped_material)?;
        let mut intermediates = Level::new(intermediate_row.kid.clone(), intermediate_key);

        let content_row = repo
            .find_active_barrier_key(BarrierKeyKind::ContentKey)
            .await?
            .ok_or(Error::Barrier(BarrierError::Sealed))?;
        let parent_kid = jwe::peek_header(&content_row.wrapped_material)?.kid;
        if !intermediates.keys.contains_key(&parent_kid) {
            let row = repo
                .find_barrier_key(BarrierKeyKind::IntermediateKey, &parent_kid)
                .await?
                .filter(|r| r.valid_for_decrypt)
                .ok_or_else(|| Error::Crypto(CryptoError::UnknownKid(parent_kid.clone())))?;
            let grandparent_kid = jwe::peek_header(&row.wrapped_material)?.kid;
            if !roots.keys.contains_key(&grandparent_kid) {
                let root = repo
                    .find_barrier_key(BarrierKeyKind::RootKey, &grandparent_kid)
                    .await?
                    .filter(|r| r.valid_for_decrypt)
                    .ok_or_else(|| {
                        Error::Crypto(CryptoError::UnknownKid(grandparent_kid.clone()))
                    })?;
                let key = unwrap_level_key(&shared_secret[..], &root.wrapped_material)
                    .map_err(|_| Error::Barrier(BarrierError::UnsealShareInvalid))?;
                roots.keys.insert(grandparent_kid.clone(), key);
            }
            let key = unwrap_level_key(&roots.keys[&grandparent_kid], &row.wrapped_material)?;
            intermediates.keys.insert(parent_kid.clone(), key);
        }
        let content_key =
            unwrap_level_key(&intermediates.keys[&parent_kid], &content_row.wrapped_material)?;
        let contents = Level::new(content_row.kid.clone(), content_key);

        tracing::info!(
            root_kid = %roots.active_kid,
            intermediate_kid = %intermediates.active_kid,
            content_kid = %contents.active_kid,
            "barrier unsealed from stored hierarchy"
        );

        Ok(Self {
            repo,
            shared_secret,
            root: RwLock::new(roots),
            intermediate: RwLock::new(intermediates),
            content: RwLock::new(contents),
            root_rotation: tokio::sync::Mutex::new(()),
            intermediate_rotation: tokio::sync::Mutex::new(()),
            content_rotation: tokio::sync::Mutex::new(()),
        })
    }

    async fn first_start(
        repo: Arc<Repository>,
        shared_secret: Zeroizing<[u8; SHARED_SECRET_LEN]>,
    ) -> Result<Self> {
        let (root_kid, root_key) = generate_level_key()?;
        let (intermediate_kid, intermediate_key) = generate_level_key()?;
        let (content_kid, content_key) = generate_level_key()?;

        let root_row = BarrierKeyRow::new_active(
            root_kid.clone(),
            BarrierKeyKind::RootKey,
            wrap_level_key(&shared_secret[..], SHARED_SECRET_KID, &root_kid, &root_key)?,
        );
        let intermediate_row = BarrierKeyRow::new_active(
            intermediate_kid.clone(),
            BarrierKeyKind::IntermediateKey,
            wrap_level_key(&root_key, &root_kid, &intermediate_kid, &intermediate_key)?,
        );
        let content_row = BarrierKeyRow::new_active(
            content_kid.clone(),
            BarrierKeyKind::ContentKey,
            wrap_level_key(
                &intermediate_key,
                &intermediate_kid,
                &content_kid,
                &content_key,
            )?,
        );

        let mut tx = repo.begin().await?;
        repo.insert_barrier_key_tx(&mut tx, &root_row).await?;
        repo.insert_barrier_key_tx(&mut tx, &intermediate_row).await?;
        repo.insert_barrier_key_tx(&mut tx, &content_row).await?;
        tx.commit().await?;

        tracing::info!(
            root_kid = %root_kid,
            intermediate_kid = %intermediate_kid,
            content_kid = %content_kid,
            "barrier initialized with a fresh key hierarchy"
        );

        Ok(Self {
            repo,
            shared_secret,
            root: RwLock::new(Level::new(root_kid, root_key)),
            intermediate: RwLock::new(Level::new(intermediate_kid, intermediate_key)),
            content: RwLock::new(Level::new(content_kid, content_key)),
            root_rotation: tokio::sync::Mutex::new(()),
            intermediate_rotation: tokio::sync::Mutex::new(()),
            content_rotation: tokio::sync::Mutex::new(()),
        })
    }

    /// Encrypt a plaintext under the active content key.
    ///
    /// Output is `kid:compact-jwe`, ASCII-safe for TEXT columns.
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let content = self.content.read().await;
        let key = content.active_key()?;
        let token = jwe::encrypt(LEVEL_ENC, key, &content.active_kid, plaintext)?;
        Ok(format!("{}:{token}", content.active_kid))
    }

    /// Decrypt a ciphertext produced by [`encrypt`](Self::encrypt), under
    /// whichever content key it names.
    pub async fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>> {
        let (kid, token) = ciphertext.split_once(':').ok_or_else(|| {
            Error::Crypto(CryptoError::BadCiphertext(
                "barrier ciphertext must be kid:jwe".into(),
            ))
        })?;
        let key = self.resolve_content_key(kid).await?;
        Ok(jwe::decrypt(&key, token)?)
    }

    /// Rotate the root key: new key wrapped by the shared secret, previous
    /// root stays valid for decrypting the intermediates it wrapped.
    pub async fn rotate_root_key(&self) -> Result<String> {
        let _guard = self
            .root_rotation
            .try_lock()
            .map_err(|_| Error::Barrier(BarrierError::RotationInProgress))?;

        let (new_kid, new_key) = generate_level_key()?;
        let row = BarrierKeyRow::new_active(
            new_kid.clone(),
            BarrierKeyKind::RootKey,
            wrap_level_key(&self.shared_secret[..], SHARED_SECRET_KID, &new_kid, &new_key)?,
        );
        let previous = self.root.read().await.active_kid.clone();
        self.persist_rotation(BarrierKeyKind::RootKey, &row, &previous)
            .await?;

        let mut root = self.root.write().await;
        root.keys.insert(new_kid.clone(), new_key);
        root.active_kid = new_kid.clone();
        drop(root);
        tracing::info!(new_kid = %new_kid, previous_kid = %previous, "root key rotated");
        Ok(new_kid)
    }

    /// Rotate the intermediate key, wrapping the successor under the active
    /// root. Content keys are not rewrapped.
    pub async fn rotate_intermediate_key(&self) -> Result<String> {
        let _guard = self
            .intermediate_rotation
            .try_lock()
            .map_err(|_| Error::Barrier(BarrierError::RotationInProgress))?;

        let (parent_kid, parent_key) = {
            let root = self.root.read().await;
            (root.active_kid.clone(), root.active_key()?.clone())
        };
        let (new_kid, new_key) = generate_level_key()?;
        let row = BarrierKeyRow::new_active(
            new_kid.clone(),
            BarrierKeyKind::IntermediateKey,
            wrap_level_key(&parent_key, &parent_kid, &new_kid, &new_key)?,
        );
        let previous = self.intermediate.read().await.active_kid.clone();
        self.persist_rotation(BarrierKeyKind::IntermediateKey, &row, &previous)
            .await?;

        let mut intermediate = self.intermediate.write().await;
        intermediate.keys.insert(new_kid.clone(), new_key);
        intermediate.active_kid = new_kid.clone();
        drop(intermediate);
        tracing::info!(new_kid = %new_kid, previous_kid = %previous, "intermediate key rotated");
        Ok(new_kid)
    }

    /// Rotate the content key. Ciphertexts under predecessors keep
    /// decrypting via their own rows; an encrypt racing the rotation
    /// commits under either the old or the new key, never a mixture.
    pub async fn rotate_content_key(&self) -> Result<String> {
        let _guard = self
            .content_rotation
            .try_lock()
            .map_err(|_| Error::Barrier(BarrierError::RotationInProgress))?;

        let (parent_kid, parent_key) = {
            let intermediate = self.intermediate.read().await;
            (
                intermediate.active_kid.clone(),
                intermediate.active_key()?.clone(),
            )
        };
        let (new_kid, new_key) = generate_level_key()?;
        let row = BarrierKeyRow::new_active(
            new_kid.clone(),
            BarrierKeyKind::ContentKey,
            wrap_level_key(&parent_key, &parent_kid, &new_kid, &new_key)?,
        );
        let previous = self.content.read().await.active_kid.clone();
        self.persist_rotation(BarrierKeyKind::ContentKey, &row, &previous)
            .await?;

        let mut content = self.content.write().await;
        content.keys.insert(new_kid.clone(), new_key);
        content.active_kid = new_kid.clone();
        drop(content);
        tracing::info!(new_kid = %new_kid, previous_kid = %previous, "content key rotated");
        Ok(new_kid)
    }

    /// Insert the successor and flip the predecessor in one transaction; a
    /// failure leaves the previous active key untouched in memory and in
    /// storage.
    async fn persist_rotation(
        &self,
        kind: BarrierKeyKind,
        row: &BarrierKeyRow,
        previous_kid: &str,
    ) -> Result<()> {
        let mut tx = self.repo.begin().await?;
        self.repo.insert_barrier_key_tx(&mut tx, row).await?;
        self.repo
            .deactivate_barrier_key_tx(&mut tx, kind, previous_kid)
            .await?;
        tx.commit().await
    }

    /// Spawn periodic rotation tasks for the levels with a configured TTL.
    pub fn spawn_rotation_tasks(
        self: &Arc<Self>,
        config: &BarrierConfig,
        cancel: &CancellationToken,
    ) {
        let ttls = [
            (BarrierKeyKind::RootKey, config.rotation.root_ttl_secs),
            (
                BarrierKeyKind::IntermediateKey,
                config.rotation.intermediate_ttl_secs,
            ),
            (BarrierKeyKind::ContentKey, config.rotation.content_ttl_secs),
        ];
        for (kind, ttl_secs) in ttls {
            let Some(secs) = ttl_secs else { continue };
            let barrier = Arc::clone(self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(secs));
                ticker.tick().await; // the first tick fires immediately
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = cancel.cancelled() => return,
                    }
                    let result = match kind {
                        BarrierKeyKind::RootKey => barrier.rotate_root_key().await,
                        BarrierKeyKind::IntermediateKey => {
                            barrier.rotate_intermediate_key().await
                        }
                        BarrierKeyKind::ContentKey => barrier.rotate_content_key().await,
                    };
                    if let Err(e) = result {
                        tracing::warn!(kind = %kind, "scheduled rotation failed: {e}");
                    }
                }
            });
        }
    }

    /// Resolve a content key by kid: memory first, then the stored row,
    /// unwrapping up the hierarchy and caching on the way back down.
    async fn resolve_content_key(&self, kid: &str) -> Result<Zeroizing<Vec<u8>>> {
        if let Some(key) = self.content.read().await.keys.get(kid) {
            return Ok(key.clone());
        }

        let row = self
            .repo
            .find_barrier_key(BarrierKeyKind::ContentKey, kid)
            .await?
            .filter(|r| r.valid_for_decrypt)
            .ok_or_else(|| Error::Crypto(CryptoError::UnknownKid(kid.to_string())))?;

        let parent_kid = jwe::peek_header(&row.wrapped_material)?.kid;
        let parent = self.resolve_intermediate_key(&parent_kid).await?;
        let key = unwrap_level_key(&parent, &row.wrapped_material)?;

        self.content
            .write()
            .await
            .keys
            .insert(kid.to_string(), key.clone());
        Ok(key)
    }

    async fn resolve_intermediate_key(&self, kid: &str) -> Result<Zeroizing<Vec<u8>>> {
        if let Some(key) = self.intermediate.read().await.keys.get(kid) {
            return Ok(key.clone());
        }

        let row = self
            .repo
            .find_barrier_key(BarrierKeyKind::IntermediateKey, kid)
            .await?
            .filter(|r| r.valid_for_decrypt)
            .ok_or_else(|| Error::Crypto(CryptoError::UnknownKid(kid.to_string())))?;

        let parent_kid = jwe::peek_header(&row.wrapped_material)?.kid;
        let parent = self.resolve_root_key(&parent_kid).await?;
        let key = unwrap_level_key(&parent, &row.wrapped_material)?;

        self.intermediate
            .write()
            .await
            .keys
            .insert(kid.to_string(), key.clone());
        Ok(key)
    }

    async fn resolve_root_key(&self, kid: &str) -> Result<Zeroizing<Vec<u8>>> {
        if kid == SHARED_SECRET_KID {
            return Ok(Zeroizing::new(self.shared_secret.to_vec()));
        }
        if let Some(key) = self.root.read().await.keys.get(kid) {
            return Ok(key.clone());
        }

        let row = self
            .repo
            .find_barrier_key(BarrierKeyKind::RootKey, kid)
            .await?
            .filter(|r| r.valid_for_decrypt)
            .ok_or_else(|| Error::Crypto(CryptoError::UnknownKid(kid.to_string())))?;

        let key = unwrap_level_key(&self.shared_secret[..], &row.wrapped_material)?;
        self.root
            .write()
            .await
            .keys
            .insert(kid.to_string(), key.clone());
        Ok(key)
    }
}

/// Generate one level key: a fresh A256GCM JWK.
fn generate_level_key() -> Result<(String, Zeroizing<Vec<u8>>)> {
    let entry = registry::lookup(LEVEL_ENC)?;
    let material = KeyMaterial::generate(entry)?;
    let jwk = material.to_jwk(entry, KeyUse::Encryption)?;
    let key = jwk.symmetric_key()?;
    Ok((jwk.kid, Zeroizing::new(key.to_vec())))
}

/// Wrap a level key (as a JWK document) under its parent key.
fn wrap_level_key(
    parent_key: &[u8],
    parent_kid: &str,
    child_kid: &str,
    child_key: &[u8],
) -> Result<String> {
    let entry = registry::lookup(LEVEL_ENC)?;
    let material = KeyMaterial::Oct(Zeroizing::new(child_key.to_vec()));
    let jwk = material.to_jwk_with_kid(entry, KeyUse::Encryption, child_kid.to_string())?;
    Ok(jwe::encrypt(
        LEVEL_ENC,
        parent_key,
        parent_kid,
        jwk.to_json()?.as_bytes(),
    )?)
}

/// Unwrap a stored level key back to its raw bytes.
fn unwrap_level_key(parent_key: &[u8], wrapped: &str) -> Result<Zeroizing<Vec<u8>>> {
    let json = jwe::decrypt(parent_key, wrapped)?;
    let jwk = Jwk::from_json(&json)?;
    Ok(Zeroizing::new(jwk.symmetric_key()?.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UnsealConfig;
    use std::io::Write;
    use tempfile::TempDir;
    use uuid::Uuid;

    async fn migrated_repo() -> Arc<Repository> {
        let repo = Repository::connect_in_memory().await.unwrap();
        repo.migrate(&[]).await.unwrap();
        Arc::new(repo)
    }

    fn barrier_config(dir: &TempDir, seed: u8) -> BarrierConfig {
        let share_files = (0..5)
            .map(|i| {
                let path = dir.path().join(format!("share-{seed}-{i}"));
                let mut file = std::fs::File::create(&path).unwrap();
                file.write_all(&[seed.wrapping_add(i as u8); 32]).unwrap();
                path
            })
            .collect();
        BarrierConfig {
            unseal: UnsealConfig {
                shares_required: 3,
                share_files,
            },
            rotation: Default::default(),
        }
    }

    #[tokio::test]
    async fn encrypt_decrypt_round_trip() {
        let repo = migrated_repo().await;
        let dir = TempDir::new().unwrap();
        let barrier = Barrier::unseal(repo, &barrier_config(&dir, 1), "svc")
            .await
            .unwrap();

        let ciphertext = barrier.encrypt(b"hello").await.unwrap();
        assert_eq!(barrier.decrypt(&ciphertext).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn content_rotation_preserves_history() {
        let repo = migrated_repo().await;
        let dir = TempDir::new().unwrap();
        let barrier = Barrier::unseal(repo, &barrier_config(&dir, 1), "svc")
            .await
            .unwrap();

        let before = barrier.encrypt(b"before rotation").await.unwrap();
        barrier.rotate_content_key().await.unwrap();
        let after = barrier.encrypt(b"after rotation").await.unwrap();

        assert_ne!(
            before.split(':').next().unwrap(),
            after.split(':').next().unwrap()
        );
        assert_eq!(barrier.decrypt(&before).await.unwrap(), b"before rotation");
        assert_eq!(barrier.decrypt(&after).await.unwrap(), b"after rotation");
    }

    #[tokio::test]
    async fn restart_with_same_shares_reproduces_plaintext() {
        let repo = migrated_repo().await;
        let dir = TempDir::new().unwrap();
        let config = barrier_config(&dir, 1);

        let ciphertext = {
            let barrier = Barrier::unseal(repo.clone(), &config, "svc").await.unwrap();
            barrier.encrypt(b"survives restart").await.unwrap()
        };

        // New barrier over the same storage and the same shares.
        let barrier = Barrier::unseal(repo, &config, "svc").await.unwrap();
        assert_eq!(
            barrier.decrypt(&ciphertext).await.unwrap(),
            b"survives restart"
        );
    }

    #[tokio::test]
    async fn restart_decrypts_across_all_rotations() {
        let repo = migrated_repo().await;
        let dir = TempDir::new().unwrap();
        let config = barrier_config(&dir, 1);

        let (c1, c2) = {
            let barrier = Barrier::unseal(repo.clone(), &config, "svc").await.unwrap();
            barrier.rotate_intermediate_key().await.unwrap();
            let c1 = barrier.encrypt(b"x").await.unwrap();
            barrier.rotate_content_key().await.unwrap();
            let c2 = barrier.encrypt(b"y").await.unwrap();
            barrier.rotate_root_key().await.unwrap();
            (c1, c2)
        };

        let barrier = Barrier::unseal(repo, &config, "svc").await.unwrap();
        assert_eq!(barrier.decrypt(&c1).await.unwrap(), b"x");
        assert_eq!(barrier.decrypt(&c2).await.unwrap(), b"y");
    }

    #[tokio::test]
    async fn wrong_shares_fail_unseal() {
        let repo = migrated_repo().await;
        let dir = TempDir::new().unwrap();
        let good = barrier_config(&dir, 1);
        let bad = barrier_config(&dir, 77);

        // Seed the hierarchy with the good shares.
        Barrier::unseal(repo.clone(), &good, "svc").await.unwrap();

        let err = Barrier::unseal(repo, &bad, "svc").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Barrier(BarrierError::UnsealShareInvalid)
        ));
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn unknown_kid_is_rejected() {
        let repo = migrated_repo().await;
        let dir = TempDir::new().unwrap();
        let barrier = Barrier::unseal(repo, &barrier_config(&dir, 1), "svc")
            .await
            .unwrap();

        let ciphertext = barrier.encrypt(b"hello").await.unwrap();
        let forged = format!(
            "{}:{}",
            Uuid::new_v4(),
            ciphertext.split_once(':').unwrap().1
        );
        assert!(matches!(
            barrier.decrypt(&forged).await.unwrap_err(),
            Error::Crypto(CryptoError::UnknownKid(_))
        ));
    }

    #[tokio::test]
    async fn malformed_ciphertext_is_rejected() {
        let repo = migrated_repo().await;
        let dir = TempDir::new().unwrap();
        let barrier = Barrier::unseal(repo, &barrier_config(&dir, 1), "svc")
            .await
            .unwrap();

        assert!(matches!(
            barrier.decrypt("no separator here").await.unwrap_err(),
            Error::Crypto(CryptoError::BadCiphertext(_))
        ));
    }
}
