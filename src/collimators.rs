//! Collimator bookkeeping
//!
//! The DCB cable carries 12 fiber bundles, each wired to a collimator that
//! can take an f-number mask. Nothing here talks to hardware: masks and
//! bundle colors are declared by the operator and persisted under the
//! `dcbMasks` and `dcbBundles` keys.

use crate::error::{DcbError, DcbResult};
use crate::sink::CommandSink;
use crate::store::KeyValueStore;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};

/// Collimators on the DCB cable.
pub const COLLIMATOR_COUNT: usize = 12;
/// Persistence key of the declared masks.
pub const MASKS_KEY: &str = "dcbMasks";
/// Persistence key of the declared bundles.
pub const BUNDLES_KEY: &str = "dcbBundles";
/// Mask or bundle slot left empty.
pub const NONE: &str = "none";

const F_NUMBERS: [&str; 3] = ["2.5", "2.8", "3.38"];

/// Unix epoch expressed as a Modified Julian Date.
const MJD_UNIX_EPOCH: f64 = 40587.0;

/// Canonical mask name: `f2.5`, `f2.8`, `f3.38` or `none`.
///
/// The f-number is accepted with or without its `f` prefix.
pub fn canonical_mask(mask: &str) -> DcbResult<String> {
    if mask == NONE {
        return Ok(NONE.to_string());
    }
    let number = mask.strip_prefix('f').unwrap_or(mask);
    if F_NUMBERS.contains(&number) {
        Ok(format!("f{number}"))
    } else {
        let valid: Vec<String> = F_NUMBERS.iter().map(|n| format!("f{n}")).collect();
        Err(DcbError::precondition(format!(
            "wrong f-number: {mask}, valid: {},{NONE}",
            valid.join(",")
        )))
    }
}

/// 64-bit design identifier of the installed bundle colors.
///
/// First eight bytes, big-endian, of the SHA-256 of the colors joined by
/// commas in collimator order.
pub fn design_id(colors: &[String]) -> u64 {
    let digest = Sha256::digest(colors.join(",").as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Modified Julian Date of `time`.
pub fn modified_julian_date(time: DateTime<Utc>) -> f64 {
    time.timestamp_millis() as f64 / 86_400_000.0 + MJD_UNIX_EPOCH
}

fn check_slot(collimator: u8) -> DcbResult<usize> {
    match collimator as usize {
        id @ 1..=COLLIMATOR_COUNT => Ok(id - 1),
        _ => Err(DcbError::precondition(format!(
            "wrong collId: {collimator}, valid: 1-{COLLIMATOR_COUNT}"
        ))),
    }
}

/// Declared masks and bundles, backed by the persistence store.
#[derive(Clone)]
pub struct Collimators {
    store: Arc<dyn KeyValueStore>,
    colors: Vec<String>,
}

impl Collimators {
    /// Records in `store`; `colors` are the bundles that may be declared.
    pub fn new(store: Arc<dyn KeyValueStore>, colors: Vec<String>) -> Self {
        Self { store, colors }
    }

    /// Bundle names that may be declared: `none` plus the configured colors.
    pub fn valid_bundles(&self) -> Vec<String> {
        std::iter::once(NONE.to_string())
            .chain(self.colors.iter().cloned())
            .collect()
    }

    async fn load_slots(&self, key: &str) -> Vec<String> {
        match self.store.load_key(key).await {
            Ok(values) if values.len() == COLLIMATOR_COUNT => values
                .iter()
                .map(|v| v.as_str().unwrap_or(NONE).to_string())
                .collect(),
            Ok(values) => {
                warn!("{}: expected {} values, found {}", key, COLLIMATOR_COUNT, values.len());
                vec![NONE.to_string(); COLLIMATOR_COUNT]
            }
            Err(DcbError::NotFound(_)) => vec![NONE.to_string(); COLLIMATOR_COUNT],
            Err(e) => {
                warn!("{}: could not be loaded: {}", key, e);
                vec![NONE.to_string(); COLLIMATOR_COUNT]
            }
        }
    }

    async fn persist_slots(&self, key: &str, slots: &[String]) -> DcbResult<()> {
        let values = slots.iter().cloned().map(Value::String).collect();
        self.store.persist_key(key, values).await
    }

    /// Masks for the 12 collimators, `none` when never declared.
    pub async fn masks(&self) -> Vec<String> {
        self.load_slots(MASKS_KEY).await
    }

    /// Bundles for the 12 collimators, `none` when never declared.
    pub async fn bundles(&self) -> Vec<String> {
        self.load_slots(BUNDLES_KEY).await
    }

    /// Install masks on the given collimators (1-based ids).
    ///
    /// Every update is validated before anything is persisted.
    pub async fn declare_masks(&self, updates: &[(u8, String)]) -> DcbResult<Vec<String>> {
        let mut validated = Vec::with_capacity(updates.len());
        for (collimator, mask) in updates {
            validated.push((check_slot(*collimator)?, canonical_mask(mask)?));
        }

        let mut masks = self.masks().await;
        for (slot, mask) in validated {
            masks[slot] = mask;
        }
        self.persist_slots(MASKS_KEY, &masks).await?;
        info!("dcbMasks={}", masks.join(","));
        Ok(masks)
    }

    /// Install bundles on the given collimators (1-based ids).
    ///
    /// A color is wired to at most one collimator: installing it clears the
    /// slot it previously occupied. With `reset`, slots not named in
    /// `updates` are cleared first.
    pub async fn declare_bundles(&self, updates: &[(u8, String)], reset: bool) -> DcbResult<Vec<String>> {
        let valid = self.valid_bundles();
        let mut validated = Vec::with_capacity(updates.len());
        for (collimator, bundle) in updates {
            let slot = check_slot(*collimator)?;
            if !valid.contains(bundle) {
                return Err(DcbError::precondition(format!(
                    "invalid bundle: {bundle}, valid: {}",
                    valid.join(",")
                )));
            }
            validated.push((slot, bundle.clone()));
        }

        let mut bundles = if reset {
            vec![NONE.to_string(); COLLIMATOR_COUNT]
        } else {
            self.bundles().await
        };
        for (slot, bundle) in validated {
            if bundle != NONE {
                if let Some(previous) = bundles.iter().position(|b| *b == bundle) {
                    bundles[previous] = NONE.to_string();
                }
            }
            bundles[slot] = bundle;
        }
        self.persist_slots(BUNDLES_KEY, &bundles).await?;
        info!("dcbBundles={}", bundles.join(","));
        Ok(bundles)
    }

    /// `dcbBundles`, `dcbMasks`, `designId` and `fiberConfig` keywords.
    pub async fn keywords(&self) -> Vec<String> {
        let bundles = self.bundles().await;
        let masks = self.masks().await;
        let colors: Vec<String> = bundles.iter().filter(|b| *b != NONE).cloned().collect();

        vec![
            format!("dcbBundles={}", bundles.join(",")),
            format!("dcbMasks={}", masks.join(",")),
            format!("designId=0x{:016x}", design_id(&colors)),
            format!("fiberConfig=\"{}\"", colors.join(";")),
        ]
    }

    /// Report every collimator keyword.
    pub async fn emit(&self, sink: &dyn CommandSink) {
        for keyword in self.keywords().await {
            sink.inform(&keyword);
        }
    }

    /// Report the time of a configuration change.
    pub fn emit_config_date(&self, sink: &dyn CommandSink) {
        sink.inform(&format!(
            "dcbConfigDate={:.6}",
            modified_julian_date(Utc::now())
        ));
    }
}
