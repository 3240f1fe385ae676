//! Engine options shared by every connection of an execution context.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const DEFAULT_GEOJSON_PRECISION: u8 = 6;
const MAX_GEOJSON_OPTIONS: u8 = 5;

/// Geometry-to-GeoJSON conversion settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoJsonOptions {
    /// Decimal places kept for every coordinate.
    pub precision: u8,
    /// SpatiaLite `AsGeoJSON` option code: bit 0 adds a bbox, 2 adds a
    /// short CRS, 4 a long CRS.
    pub options: u8,
}

impl GeoJsonOptions {
    pub fn new(precision: u8, options: u8) -> Self {
        Self {
            precision,
            options: options.min(MAX_GEOJSON_OPTIONS),
        }
    }

    pub fn with_bbox(&self) -> bool {
        self.options & 1 == 1
    }

    pub fn short_crs(&self) -> bool {
        matches!(self.options, 2 | 3)
    }

    pub fn long_crs(&self) -> bool {
        matches!(self.options, 4 | 5)
    }
}

impl Default for GeoJsonOptions {
    fn default() -> Self {
        Self::new(DEFAULT_GEOJSON_PRECISION, 0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplOptions {
    #[serde(rename = "autoJSON", default = "default_auto_json")]
    pub auto_json: bool,
    #[serde(
        rename = "autoGeoJSON",
        default = "default_auto_geojson",
        with = "geojson_flag"
    )]
    pub auto_geojson: Option<GeoJsonOptions>,
}

impl Default for SplOptions {
    fn default() -> Self {
        Self {
            auto_json: default_auto_json(),
            auto_geojson: default_auto_geojson(),
        }
    }
}

impl SplOptions {
    pub fn without_json(mut self) -> Self {
        self.auto_json = false;
        self
    }

    pub fn without_geojson(mut self) -> Self {
        self.auto_geojson = None;
        self
    }

    pub fn with_geojson(mut self, options: GeoJsonOptions) -> Self {
        self.auto_geojson = Some(options);
        self
    }
}

fn default_auto_json() -> bool {
    true
}

fn default_auto_geojson() -> Option<GeoJsonOptions> {
    Some(GeoJsonOptions::default())
}

/// `autoGeoJSON` is either `false` or an options object on the wire.
mod geojson_flag {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Enabled(bool),
        Options(GeoJsonOptions),
    }

    pub fn serialize<S: Serializer>(
        value: &Option<GeoJsonOptions>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(options) => options.serialize(serializer),
            None => serializer.serialize_bool(false),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<GeoJsonOptions>, D::Error> {
        Ok(match Flag::deserialize(deserializer)? {
            Flag::Enabled(true) => Some(GeoJsonOptions::default()),
            Flag::Enabled(false) => None,
            Flag::Options(options) => Some(GeoJsonOptions::new(options.precision, options.options)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_json_and_geojson() {
        let options = SplOptions::default();
        assert!(options.auto_json);
        assert_eq!(options.auto_geojson, Some(GeoJsonOptions::new(6, 0)));
    }

    #[test]
    fn geojson_false_disables_conversion() {
        let options: SplOptions =
            serde_json::from_str(r#"{"autoJSON":false,"autoGeoJSON":false}"#).expect("options");
        assert!(!options.auto_json);
        assert_eq!(options.auto_geojson, None);
        let encoded = serde_json::to_string(&options).expect("encode");
        assert_eq!(encoded, r#"{"autoJSON":false,"autoGeoJSON":false}"#);
    }

    #[test]
    fn geojson_options_are_clamped() {
        let options: SplOptions =
            serde_json::from_str(r#"{"autoGeoJSON":{"precision":3,"options":9}}"#)
                .expect("options");
        assert!(options.auto_json);
        let geo = options.auto_geojson.expect("geojson");
        assert_eq!(geo.precision, 3);
        assert_eq!(geo.options, 5);
        assert!(geo.with_bbox());
        assert!(geo.long_crs());
    }
}
