// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! XSD-typed parameter values.
//!
//! CWMP parameters carry a literal plus an XML Schema type. The engine keeps
//! both, because type changes on the CPE are meaningful (a `SetParameterValues`
//! must be encoded with the type the device reports, not the type a script
//! happened to use).

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeTuple, Serializer};
use serde::{Deserialize, Serialize};

/// The subset of XSD types a CPE data model may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum XsdType {
    /// `xsd:string` - also the fallback when a CPE omits the type.
    #[default]
    String,
    /// `xsd:int`
    Int,
    /// `xsd:unsignedInt`
    UnsignedInt,
    /// `xsd:boolean`
    Boolean,
    /// `xsd:dateTime`
    DateTime,
    /// `xsd:base64`
    Base64,
    /// `xsd:hexBinary`
    HexBinary,
}

impl XsdType {
    /// Canonical spelling used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            XsdType::String => "xsd:string",
            XsdType::Int => "xsd:int",
            XsdType::UnsignedInt => "xsd:unsignedInt",
            XsdType::Boolean => "xsd:boolean",
            XsdType::DateTime => "xsd:dateTime",
            XsdType::Base64 => "xsd:base64",
            XsdType::HexBinary => "xsd:hexBinary",
        }
    }

    /// All valid types, in canonical order.
    pub const ALL: [XsdType; 7] = [
        XsdType::String,
        XsdType::Int,
        XsdType::UnsignedInt,
        XsdType::Boolean,
        XsdType::DateTime,
        XsdType::Base64,
        XsdType::HexBinary,
    ];
}

impl fmt::Display for XsdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a type string is not one of the known XSD types.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown XSD type: {0}")]
pub struct UnknownXsdType(pub String);

impl FromStr for XsdType {
    type Err = UnknownXsdType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "xsd:string" | "string" => Ok(XsdType::String),
            "xsd:int" | "int" => Ok(XsdType::Int),
            "xsd:unsignedInt" | "unsignedInt" => Ok(XsdType::UnsignedInt),
            "xsd:boolean" | "boolean" => Ok(XsdType::Boolean),
            // Some CPEs (and some scripts) spell this lower-case. Accepted as
            // an alias, normalized to the canonical spelling.
            "xsd:dateTime" | "xsd:datetime" | "dateTime" => Ok(XsdType::DateTime),
            "xsd:base64" | "base64" => Ok(XsdType::Base64),
            "xsd:hexBinary" | "hexBinary" => Ok(XsdType::HexBinary),
            other => Err(UnknownXsdType(other.to_string())),
        }
    }
}

impl Serialize for XsdType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for XsdType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// A parameter value: literal plus XSD type.
///
/// Serialized as a two-element tuple `[literal, "xsd:..."]`, which is also
/// the shape scripts produce and the session snapshot stores.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterValue {
    /// The literal. JSON-typed: strings stay strings, `xsd:int` values are
    /// numbers, `xsd:boolean` values are booleans. Sanitization (in the
    /// session crate) enforces the literal/type agreement.
    pub literal: serde_json::Value,
    /// The XSD type tag.
    pub xsd_type: XsdType,
}

impl ParameterValue {
    /// Construct a value from a literal and type.
    pub fn new(literal: impl Into<serde_json::Value>, xsd_type: XsdType) -> Self {
        Self {
            literal: literal.into(),
            xsd_type,
        }
    }

    /// A string value.
    pub fn string(s: impl Into<String>) -> Self {
        Self::new(s.into(), XsdType::String)
    }

    /// The literal rendered the way it is encoded on the wire.
    pub fn literal_string(&self) -> String {
        match &self.literal {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl Serialize for ParameterValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(2)?;
        tup.serialize_element(&self.literal)?;
        tup.serialize_element(&self.xsd_type)?;
        tup.end()
    }
}

impl<'de> Deserialize<'de> for ParameterValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TupleVisitor;

        impl<'de> Visitor<'de> for TupleVisitor {
            type Value = ParameterValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a [literal, xsdType] pair")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let literal: serde_json::Value = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let xsd_type: Option<XsdType> = seq.next_element()?;
                Ok(ParameterValue {
                    literal,
                    xsd_type: xsd_type.unwrap_or_default(),
                })
            }
        }

        deserializer.deserialize_seq(TupleVisitor)
    }
}
