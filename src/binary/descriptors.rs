//! Type descriptor records.
//!
//! A descriptor block is a flat sequence of self-describing records. Records
//! refer to earlier records by their position in the block; annotation
//! records (types `0x80..=0xff`) carry no codec and take no position.

use bytes::Bytes;
use uuid::Uuid;

use super::packet::PacketReader;
use crate::error::{Error, Result};

/// Flags on an object shape element.
pub mod element_flags {
    pub const IMPLICIT: u32 = 1 << 0;
    pub const LINK_PROPERTY: u32 = 1 << 1;
    pub const LINK: u32 = 1 << 2;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeElement {
    pub flags: u32,
    pub cardinality: u8,
    pub name: String,
    pub type_pos: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleElement {
    pub name: String,
    pub type_pos: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    Set {
        id: Uuid,
        type_pos: u16,
    },
    ObjectShape {
        id: Uuid,
        elements: Vec<ShapeElement>,
    },
    BaseScalar {
        id: Uuid,
    },
    Scalar {
        id: Uuid,
        base_type_pos: u16,
    },
    Tuple {
        id: Uuid,
        element_types: Vec<u16>,
    },
    NamedTuple {
        id: Uuid,
        elements: Vec<TupleElement>,
    },
    Array {
        id: Uuid,
        type_pos: u16,
        dimensions: Vec<i32>,
    },
    Enumeration {
        id: Uuid,
        members: Vec<String>,
    },
    InputShape {
        id: Uuid,
        elements: Vec<ShapeElement>,
    },
    Range {
        id: Uuid,
        type_pos: u16,
    },
    /// Annotation record; consumed, never built.
    Annotation {
        kind: u8,
        id: Uuid,
        annotation: String,
    },
}

impl Descriptor {
    pub fn id(&self) -> Uuid {
        match self {
            Descriptor::Set { id, .. }
            | Descriptor::ObjectShape { id, .. }
            | Descriptor::BaseScalar { id }
            | Descriptor::Scalar { id, .. }
            | Descriptor::Tuple { id, .. }
            | Descriptor::NamedTuple { id, .. }
            | Descriptor::Array { id, .. }
            | Descriptor::Enumeration { id, .. }
            | Descriptor::InputShape { id, .. }
            | Descriptor::Range { id, .. }
            | Descriptor::Annotation { id, .. } => *id,
        }
    }

    pub fn is_annotation(&self) -> bool {
        matches!(self, Descriptor::Annotation { .. })
    }

    /// Read one record.
    pub fn read(r: &mut PacketReader) -> Result<Self> {
        let kind = r.read_u8()?;
        let id = r.read_uuid()?;

        let descriptor = match kind {
            0 => Descriptor::Set {
                id,
                type_pos: r.read_u16()?,
            },
            1 => Descriptor::ObjectShape {
                id,
                elements: read_shape_elements(r)?,
            },
            2 => Descriptor::BaseScalar { id },
            3 => Descriptor::Scalar {
                id,
                base_type_pos: r.read_u16()?,
            },
            4 => {
                let count = r.read_u16()?;
                let mut element_types = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    element_types.push(r.read_u16()?);
                }
                Descriptor::Tuple { id, element_types }
            }
            5 => {
                let count = r.read_u16()?;
                let mut elements = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    elements.push(TupleElement {
                        name: r.read_string()?,
                        type_pos: r.read_u16()?,
                    });
                }
                Descriptor::NamedTuple { id, elements }
            }
            6 => {
                let type_pos = r.read_u16()?;
                let count = r.read_u16()?;
                let mut dimensions = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    dimensions.push(r.read_i32()?);
                }
                Descriptor::Array {
                    id,
                    type_pos,
                    dimensions,
                }
            }
            7 => {
                let count = r.read_u16()?;
                let mut members = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    members.push(r.read_string()?);
                }
                Descriptor::Enumeration { id, members }
            }
            8 => Descriptor::InputShape {
                id,
                elements: read_shape_elements(r)?,
            },
            9 => Descriptor::Range {
                id,
                type_pos: r.read_u16()?,
            },
            0x80..=0xff => Descriptor::Annotation {
                kind,
                id,
                annotation: r.read_string()?,
            },
            other => {
                return Err(Error::Protocol(format!(
                    "Unknown type descriptor 0x{:02x} for {}",
                    other, id
                )))
            }
        };

        Ok(descriptor)
    }
}

fn read_shape_elements(r: &mut PacketReader) -> Result<Vec<ShapeElement>> {
    let count = r.read_u16()?;
    let mut elements = Vec::with_capacity(count as usize);
    for _ in 0..count {
        elements.push(ShapeElement {
            flags: r.read_u32()?,
            cardinality: r.read_u8()?,
            name: r.read_string()?,
            type_pos: r.read_u16()?,
        });
    }
    Ok(elements)
}

/// Parse a whole descriptor block in encounter order.
pub fn parse_descriptors(block: Bytes) -> Result<Vec<Descriptor>> {
    let mut r = PacketReader::new(block);
    let mut descriptors = Vec::new();
    while !r.is_empty() {
        descriptors.push(Descriptor::read(&mut r)?);
    }
    Ok(descriptors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::packet::PacketWriter;

    #[test]
    fn test_parse_shape_with_annotation() {
        let str_id = Uuid::from_u128(0x101);
        let shape_id = Uuid::from_u128(0xabc);

        let mut w = PacketWriter::new();
        // base scalar str
        w.write_u8(2);
        w.write_uuid(&str_id);
        // annotation, no position
        w.write_u8(0xff);
        w.write_uuid(&str_id);
        w.write_string("std::str");
        // shape { name: str }
        w.write_u8(1);
        w.write_uuid(&shape_id);
        w.write_u16(1);
        w.write_u32(0);
        w.write_u8(0x41);
        w.write_string("name");
        w.write_u16(0);

        let parsed = parse_descriptors(w.freeze()).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0], Descriptor::BaseScalar { id: str_id });
        assert!(parsed[1].is_annotation());
        assert_eq!(
            parsed[2],
            Descriptor::ObjectShape {
                id: shape_id,
                elements: vec![ShapeElement {
                    flags: 0,
                    cardinality: 0x41,
                    name: "name".into(),
                    type_pos: 0,
                }],
            }
        );
    }

    #[test]
    fn test_unknown_descriptor_type_is_error() {
        let mut w = PacketWriter::new();
        w.write_u8(0x42);
        w.write_uuid(&Uuid::nil());
        assert!(matches!(
            parse_descriptors(w.freeze()),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_truncated_record_is_end_of_stream() {
        let mut w = PacketWriter::new();
        w.write_u8(0);
        w.write_uuid(&Uuid::nil());
        w.write_u8(0); // half of a u16 position
        assert!(matches!(
            parse_descriptors(w.freeze()),
            Err(Error::EndOfStream { .. })
        ));
    }
}
