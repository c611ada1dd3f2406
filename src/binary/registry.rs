//! Codec and query caches.
//!
//! This module provides:
//! - `CodecRegistry`: descriptor id → codec tree, built lazily from
//!   server-sent descriptor blocks and kept until `clear`
//! - `query_hash`: the key under which a query's codec ids are remembered

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use tracing::debug;
use uuid::Uuid;

use super::codec::{
    Codec, CodecKind, NamedCodec, ObjectField, ScalarKind, EMPTY_TUPLE_ID, NULL_CODEC_ID,
};
use super::descriptors::{parse_descriptors, Descriptor};
use super::protocol::{Cardinality, IoFormat};
use crate::error::{Error, Result};

/// Built-in codecs reachable without a descriptor block.
static WELL_KNOWN: Lazy<HashMap<Uuid, Arc<Codec>>> = Lazy::new(|| {
    let mut table: HashMap<Uuid, Arc<Codec>> = ScalarKind::ALL
        .into_iter()
        .map(|kind| (kind.id(), Arc::new(Codec::scalar(kind))))
        .collect();
    table.insert(NULL_CODEC_ID, Arc::new(Codec::null()));
    table.insert(
        EMPTY_TUPLE_ID,
        Arc::new(Codec::new(EMPTY_TUPLE_ID, CodecKind::Tuple(Vec::new()))),
    );
    table
});

static GLOBAL: Lazy<Arc<CodecRegistry>> = Lazy::new(|| Arc::new(CodecRegistry::new()));

/// Input and output codec ids remembered for one query key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryCodecIds {
    pub input: Uuid,
    pub output: Uuid,
}

// ============================================================================
// Codec Registry
// ============================================================================

/// Concurrent, append-only cache of codec trees and query codec ids.
///
/// Entries are keyed by content-derived ids and never mutated once inserted,
/// so concurrent builders racing on the same id produce equal trees and the
/// loser's insert is harmless.
#[derive(Debug, Default)]
pub struct CodecRegistry {
    codecs: DashMap<Uuid, Arc<Codec>>,
    queries: DashMap<u64, QueryCodecIds>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry shared by clients that do not bring their own.
    pub fn global() -> Arc<CodecRegistry> {
        Arc::clone(&GLOBAL)
    }

    /// Cached codec, falling back to the well-known scalar table.
    pub fn get_codec(&self, id: &Uuid) -> Option<Arc<Codec>> {
        if let Some(codec) = self.codecs.get(id) {
            return Some(Arc::clone(codec.value()));
        }
        WELL_KNOWN.get(id).cloned()
    }

    /// Build (or fetch) the codec for `id` from a descriptor block.
    ///
    /// Records are built strictly in encounter order; each non-annotation
    /// record takes the next position and may only reference positions
    /// already built. The last record built is the root.
    pub fn build_codec(&self, id: Uuid, descriptor: Bytes) -> Result<Arc<Codec>> {
        if let Some(codec) = self.get_codec(&id) {
            return Ok(codec);
        }

        let descriptors = parse_descriptors(descriptor)?;
        let mut built: Vec<Arc<Codec>> = Vec::with_capacity(descriptors.len());

        for descriptor in descriptors.iter().filter(|d| !d.is_annotation()) {
            let codec = match self.get_codec(&descriptor.id()) {
                Some(existing) => existing,
                None => {
                    let codec = Arc::new(build_one(descriptor, &built)?);
                    self.codecs.insert(codec.id, Arc::clone(&codec));
                    codec
                }
            };
            built.push(codec);
        }

        let root = built.pop().ok_or_else(|| {
            Error::MissingCodec(format!("empty descriptor block for type {}", id))
        })?;

        if root.id != id {
            return Err(Error::Protocol(format!(
                "descriptor block root {} does not match requested type {}",
                root.id, id
            )));
        }

        debug!(type_id = %id, records = descriptors.len(), "Built codec");
        Ok(root)
    }

    pub fn cache_query(&self, key: u64, input: Uuid, output: Uuid) {
        self.queries.insert(key, QueryCodecIds { input, output });
    }

    pub fn query_codec_ids(&self, key: u64) -> Option<QueryCodecIds> {
        self.queries.get(&key).map(|entry| *entry.value())
    }

    /// Both codecs for a cached query, if the query and its codecs are known.
    pub fn query_codecs(&self, key: u64) -> Option<(Arc<Codec>, Arc<Codec>)> {
        let ids = self.query_codec_ids(key)?;
        Some((self.get_codec(&ids.input)?, self.get_codec(&ids.output)?))
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }

    /// Drop every built codec and query mapping, e.g. after a schema change.
    /// Well-known scalars stay available.
    pub fn clear(&self) {
        self.codecs.clear();
        self.queries.clear();
    }
}

fn child(built: &[Arc<Codec>], pos: u16) -> Result<Arc<Codec>> {
    built.get(pos as usize).cloned().ok_or_else(|| {
        Error::Protocol(format!(
            "type descriptor references position {} but only {} are built",
            pos,
            built.len()
        ))
    })
}

fn build_one(descriptor: &Descriptor, built: &[Arc<Codec>]) -> Result<Codec> {
    let kind = match descriptor {
        Descriptor::Set { type_pos, .. } => CodecKind::Set(child(built, *type_pos)?),
        Descriptor::ObjectShape { elements, .. } => CodecKind::Object(
            elements
                .iter()
                .map(|e| {
                    Ok(ObjectField {
                        name: e.name.clone(),
                        flags: e.flags,
                        cardinality: e.cardinality,
                        codec: child(built, e.type_pos)?,
                    })
                })
                .collect::<Result<_>>()?,
        ),
        Descriptor::BaseScalar { id } => {
            let kind = ScalarKind::from_id(id)
                .ok_or_else(|| Error::MissingCodec(format!("no base scalar codec for {}", id)))?;
            CodecKind::Scalar(kind)
        }
        Descriptor::Scalar { base_type_pos, .. } => child(built, *base_type_pos)?.kind.clone(),
        Descriptor::Tuple { element_types, .. } => CodecKind::Tuple(
            element_types
                .iter()
                .map(|pos| child(built, *pos))
                .collect::<Result<_>>()?,
        ),
        Descriptor::NamedTuple { elements, .. } => CodecKind::NamedTuple(
            elements
                .iter()
                .map(|e| {
                    Ok(NamedCodec {
                        name: e.name.clone(),
                        codec: child(built, e.type_pos)?,
                    })
                })
                .collect::<Result<_>>()?,
        ),
        Descriptor::Array { type_pos, .. } => CodecKind::Array(child(built, *type_pos)?),
        // Enum members travel as their label text.
        Descriptor::Enumeration { .. } => CodecKind::Scalar(ScalarKind::Str),
        Descriptor::InputShape { elements, .. } => CodecKind::SparseObject(
            elements
                .iter()
                .map(|e| {
                    Ok(NamedCodec {
                        name: e.name.clone(),
                        codec: child(built, e.type_pos)?,
                    })
                })
                .collect::<Result<_>>()?,
        ),
        Descriptor::Range { type_pos, .. } => CodecKind::Range(child(built, *type_pos)?),
        Descriptor::Annotation { id, .. } => {
            return Err(Error::Protocol(format!(
                "annotation {} cannot be built into a codec",
                id
            )))
        }
    };
    Ok(Codec::new(descriptor.id(), kind))
}

// ============================================================================
// Query hash
// ============================================================================

const HASH_SEED: u64 = 3_074_457_345_618_258_791;
const HASH_MULTIPLIER: u64 = 3_074_457_345_618_258_799;

/// Knuth multiplicative hash over the UTF-16 units of the query text,
/// folded with the cardinality and io-format byte values.
///
/// Not collision resistant; a collision only costs a redundant describe
/// because codec ids from `PrepareComplete` are checked before reuse.
pub fn query_hash(query: &str, cardinality: Cardinality, format: IoFormat) -> u64 {
    let mut hash = HASH_SEED;
    for unit in query.encode_utf16() {
        hash = hash
            .wrapping_add(u64::from(unit))
            .wrapping_mul(HASH_MULTIPLIER);
    }
    hash.wrapping_mul(cardinality as u64)
        .wrapping_mul(format as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::packet::PacketWriter;
    use pretty_assertions::assert_eq;

    const SHAPE_ID: Uuid = Uuid::from_u128(0xAAAA);
    const SET_ID: Uuid = Uuid::from_u128(0xBBBB);

    /// `{ id: int64, tags: array<str> }` plus a set wrapping it.
    fn shape_block() -> Bytes {
        let mut w = PacketWriter::new();
        // 0: int64
        w.write_u8(2);
        w.write_uuid(&ScalarKind::Int64.id());
        // 1: str
        w.write_u8(2);
        w.write_uuid(&ScalarKind::Str.id());
        // annotation, takes no position
        w.write_u8(0xff);
        w.write_uuid(&ScalarKind::Str.id());
        w.write_string("std::str");
        // 2: array<str>
        w.write_u8(6);
        w.write_uuid(&Uuid::from_u128(0xCCCC));
        w.write_u16(1);
        w.write_u16(1);
        w.write_i32(-1);
        // 3: shape
        w.write_u8(1);
        w.write_uuid(&SHAPE_ID);
        w.write_u16(2);
        w.write_u32(0);
        w.write_u8(Cardinality::One as u8);
        w.write_string("id");
        w.write_u16(0);
        w.write_u32(0);
        w.write_u8(Cardinality::Many as u8);
        w.write_string("tags");
        w.write_u16(2);
        // 4: set<shape>
        w.write_u8(0);
        w.write_uuid(&SET_ID);
        w.write_u16(3);
        w.freeze()
    }

    #[test]
    fn test_well_known_scalars() {
        let registry = CodecRegistry::new();
        for kind in ScalarKind::ALL {
            let codec = registry.get_codec(&kind.id()).unwrap();
            assert_eq!(codec.kind, CodecKind::Scalar(kind));
        }
        assert_eq!(
            registry.get_codec(&Uuid::nil()).unwrap().kind,
            CodecKind::Null
        );
        assert_eq!(
            registry.get_codec(&EMPTY_TUPLE_ID).unwrap().kind,
            CodecKind::Tuple(vec![])
        );
        assert!(registry.get_codec(&Uuid::from_u128(0x999)).is_none());
    }

    #[test]
    fn test_build_nested_shape() {
        let registry = CodecRegistry::new();
        let root = registry.build_codec(SET_ID, shape_block()).unwrap();

        let CodecKind::Set(inner) = &root.kind else {
            panic!("expected set, got {:?}", root.kind);
        };
        let CodecKind::Object(fields) = &inner.kind else {
            panic!("expected object, got {:?}", inner.kind);
        };
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].name, "id");
        assert_eq!(fields[0].codec.kind, CodecKind::Scalar(ScalarKind::Int64));
        assert_eq!(
            fields[1].codec.kind,
            CodecKind::Array(Arc::new(Codec::scalar(ScalarKind::Str)))
        );

        // Intermediate records are cached under their own ids
        assert!(registry.get_codec(&SHAPE_ID).is_some());
        assert!(registry.get_codec(&Uuid::from_u128(0xCCCC)).is_some());
    }

    #[test]
    fn test_build_is_reproducible() {
        let first = CodecRegistry::new()
            .build_codec(SET_ID, shape_block())
            .unwrap();
        let second = CodecRegistry::new()
            .build_codec(SET_ID, shape_block())
            .unwrap();
        assert_eq!(first, second);

        let registry = CodecRegistry::new();
        let before = registry.build_codec(SET_ID, shape_block()).unwrap();
        registry.clear();
        assert!(registry.get_codec(&SET_ID).is_none());
        let after = registry.build_codec(SET_ID, shape_block()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_derived_scalar_and_enum() {
        let derived = Uuid::from_u128(0xD1);
        let color = Uuid::from_u128(0xE1);
        let tuple = Uuid::from_u128(0xF1);

        let mut w = PacketWriter::new();
        w.write_u8(2);
        w.write_uuid(&ScalarKind::Int32.id());
        w.write_u8(3);
        w.write_uuid(&derived);
        w.write_u16(0);
        w.write_u8(7);
        w.write_uuid(&color);
        w.write_u16(2);
        w.write_string("Red");
        w.write_string("Green");
        w.write_u8(4);
        w.write_uuid(&tuple);
        w.write_u16(2);
        w.write_u16(1);
        w.write_u16(2);

        let registry = CodecRegistry::new();
        let root = registry.build_codec(tuple, w.freeze()).unwrap();
        let CodecKind::Tuple(children) = &root.kind else {
            panic!("expected tuple");
        };
        assert_eq!(children[0].id, derived);
        assert_eq!(children[0].kind, CodecKind::Scalar(ScalarKind::Int32));
        assert_eq!(children[1].kind, CodecKind::Scalar(ScalarKind::Str));
    }

    #[test]
    fn test_forward_reference_is_rejected() {
        let mut w = PacketWriter::new();
        w.write_u8(0);
        w.write_uuid(&SET_ID);
        w.write_u16(0);

        let registry = CodecRegistry::new();
        assert!(matches!(
            registry.build_codec(SET_ID, w.freeze()),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_unknown_base_scalar_is_missing_codec() {
        let custom = Uuid::from_u128(0x1234_5678);
        let mut w = PacketWriter::new();
        w.write_u8(2);
        w.write_uuid(&custom);

        let registry = CodecRegistry::new();
        assert!(matches!(
            registry.build_codec(custom, w.freeze()),
            Err(Error::MissingCodec(_))
        ));
    }

    #[test]
    fn test_input_shape_builds_sparse_object() {
        let input = Uuid::from_u128(0x1F);
        let mut w = PacketWriter::new();
        w.write_u8(2);
        w.write_uuid(&ScalarKind::Str.id());
        w.write_u8(8);
        w.write_uuid(&input);
        w.write_u16(1);
        w.write_u32(0);
        w.write_u8(Cardinality::AtMostOne as u8);
        w.write_string("name");
        w.write_u16(0);

        let codec = CodecRegistry::new().build_codec(input, w.freeze()).unwrap();
        assert!(codec.is_argument_codec());
        assert!(matches!(codec.kind, CodecKind::SparseObject(ref f) if f.len() == 1));
    }

    #[test]
    fn test_query_hash_keys() {
        let a = query_hash("select 1", Cardinality::Many, IoFormat::Binary);
        let b = query_hash("select 1", Cardinality::Many, IoFormat::Binary);
        let c = query_hash("select 1", Cardinality::One, IoFormat::Binary);
        let d = query_hash("select 2", Cardinality::Many, IoFormat::Binary);
        let e = query_hash("select 1", Cardinality::Many, IoFormat::Json);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_ne!(a, e);
    }

    #[test]
    fn test_query_cache_lookup() {
        let registry = CodecRegistry::new();
        let key = query_hash("select 1", Cardinality::One, IoFormat::Binary);
        assert!(registry.query_codecs(key).is_none());

        registry.cache_query(key, NULL_CODEC_ID, ScalarKind::Int64.id());
        let (input, output) = registry.query_codecs(key).unwrap();
        assert_eq!(input.kind, CodecKind::Null);
        assert_eq!(output.kind, CodecKind::Scalar(ScalarKind::Int64));
    }
}
