//! Persisted inter-package facts.
//!
//! A fact is an opaque, versioned byte blob: a magic prefix, one version
//! byte, and a postcard payload holding the package's exported annotation
//! map (entries in site order, so encoding is deterministic) and its
//! published full triggers.

use nilgazer_annotations::{ObservedMap, Site, Val};
use nilgazer_core::FullTrigger;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const FACT_MAGIC: &[u8; 4] = b"NGZF";
const FACT_VERSION: u8 = 2;

#[derive(Error, Debug)]
pub enum FactError {
    #[error("fact blob does not start with the nilgazer magic")]
    BadMagic,
    #[error("unsupported fact version {0} (expected {FACT_VERSION})")]
    UnsupportedVersion(u8),
    #[error("fact payload was truncated or corrupted: {0}")]
    Codec(#[from] postcard::Error),
}

/// One package's exported analysis state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackageFact {
    pub pkg: String,
    pub map: ObservedMap,
    pub triggers: Vec<FullTrigger>,
}

#[derive(Serialize, Deserialize)]
struct Payload {
    pkg: String,
    entries: Vec<(Site, Val)>,
    triggers: Vec<FullTrigger>,
}

/// Serializes a fact. Two encodes of equal facts are byte-identical.
pub fn encode(fact: &PackageFact) -> Result<Vec<u8>, FactError> {
    let payload = Payload {
        pkg: fact.pkg.clone(),
        entries: fact.map.sorted_entries(),
        triggers: fact.triggers.clone(),
    };
    let encoded = postcard::to_allocvec(&payload)?;
    let mut out = Vec::with_capacity(FACT_MAGIC.len() + 1 + encoded.len());
    out.extend_from_slice(FACT_MAGIC);
    out.push(FACT_VERSION);
    out.extend_from_slice(&encoded);
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<PackageFact, FactError> {
    if bytes.len() < FACT_MAGIC.len() + 1 || &bytes[..FACT_MAGIC.len()] != FACT_MAGIC {
        return Err(FactError::BadMagic);
    }
    let version = bytes[FACT_MAGIC.len()];
    if version != FACT_VERSION {
        return Err(FactError::UnsupportedVersion(version));
    }
    let payload: Payload = postcard::from_bytes(&bytes[FACT_MAGIC.len() + 1..])?;
    let mut map = ObservedMap::new();
    for (site, val) in payload.entries {
        map.insert(site, val);
    }
    Ok(PackageFact {
        pkg: payload.pkg,
        map,
        triggers: payload.triggers,
    })
}
