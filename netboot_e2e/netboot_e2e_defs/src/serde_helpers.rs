// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Serde adapters that write [`Duration`] values as plain integers, so that
//! scenario and config files stay hand-editable.

use serde::Deserialize;
use serde::Deserializer;
use serde::Serializer;
use std::time::Duration;

/// Serializes a [`Duration`] as whole seconds.
pub mod duration_secs {
    use super::*;

    #[expect(missing_docs)]
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    #[expect(missing_docs)]
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Serializes an optional [`Duration`] as whole seconds.
pub mod option_duration_secs {
    use super::*;

    #[expect(missing_docs)]
    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    #[expect(missing_docs)]
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

/// Serializes a [`Duration`] as whole milliseconds.
pub mod duration_millis {
    use super::*;

    #[expect(missing_docs)]
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().try_into().unwrap_or(u64::MAX))
    }

    #[expect(missing_docs)]
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
