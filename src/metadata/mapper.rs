use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use serde::Deserialize;

use super::value::{Document, Section, Value};
use super::{Error, LogicalVolume, SECTOR_SIZE, Metadata, PhysicalVolume, Segment, StripeArea, VolumeGroup};

/// A section being mapped, with the dotted path that leads to it.
struct Scope<'a> {
    path: String,
    section: &'a Section,
}

impl<'a> Scope<'a> {
    fn path_of(&self, key: &str) -> String {
        if self.path.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", self.path, key)
        }
    }

    fn shape_error(&self, key: Option<&str>, problem: impl Into<String>) -> Error {
        let path = key.map_or_else(|| self.path.clone(), |key| self.path_of(key));
        Error::UnexpectedShape { path, problem: problem.into() }
    }

    fn child(&self, name: &str, section: &'a Section) -> Scope<'a> {
        Scope { path: self.path_of(name), section }
    }

    fn convert<T: Deserialize<'a>>(&self, key: &str, value: &'a Value) -> Result<T, Error> {
        T::deserialize(value).map_err(|e| self.shape_error(Some(key), e.to_string()))
    }

    fn optional<T: Deserialize<'a>>(&self, key: &str) -> Result<Option<T>, Error> {
        self.section.get(key).map(|value| self.convert(key, value)).transpose()
    }

    fn required<T: Deserialize<'a>>(&self, key: &str) -> Result<T, Error> {
        self.optional(key)?.ok_or_else(|| self.shape_error(Some(key), "required key is missing"))
    }

    /// String lists like `status` or `tags`; absent means empty.
    fn list(&self, key: &str) -> Result<Vec<String>, Error> {
        Ok(self.optional(key)?.unwrap_or_default())
    }

    fn optional_section(&self, key: &str) -> Result<Option<Scope<'a>>, Error> {
        match self.section.get(key) {
            None => Ok(None),
            Some(Value::Section(section)) => Ok(Some(self.child(key, section))),
            Some(other) => Err(self.shape_error(Some(key), format!("expected a section, found {}", other.kind()))),
        }
    }

    fn required_section(&self, key: &str) -> Result<Scope<'a>, Error> {
        self.optional_section(key)?.ok_or_else(|| self.shape_error(Some(key), "required section is missing"))
    }

    /// Every entry of this scope must itself be a section.
    fn children(&self) -> Result<Vec<Scope<'a>>, Error> {
        self.section
            .iter()
            .map(|(name, value)| match value {
                Value::Section(section) => Ok(self.child(name, section)),
                other => Err(self.shape_error(Some(name), format!("expected a section, found {}", other.kind()))),
            })
            .collect()
    }

    fn name(&self) -> String {
        self.path.rsplit('.').next().unwrap_or_default().to_string()
    }

    fn properties(&self, consumed: impl Fn(&str, &Value) -> bool) -> BTreeMap<String, Value> {
        self.section
            .iter()
            .filter(|(name, value)| !consumed(name, value))
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }
}

impl Metadata {
    const KEYS: &'static [&'static str] = &["contents", "version", "description", "creation_host", "creation_time"];

    /// Projects a parsed document onto the typed model.
    ///
    /// Every top-level section is taken to be a volume group.
    pub fn from_document(document: &Document) -> Result<Self, Error> {
        let scope = Scope { path: String::new(), section: document };

        let mut volume_groups = BTreeMap::new();
        for (name, value) in document.iter() {
            if let Value::Section(section) = value {
                let vg = VolumeGroup::from_scope(&scope.child(name, section))?;
                volume_groups.insert(name.to_string(), vg);
            }
        }
        if volume_groups.is_empty() {
            return Err(scope.shape_error(None, "no volume group section found"));
        }

        Ok(Self {
            contents: scope.optional("contents")?,
            version: scope.optional("version")?,
            description: scope.optional("description")?,
            creation_host: scope.optional("creation_host")?,
            creation_time: scope.optional("creation_time")?,
            volume_groups,
            properties: scope
                .properties(|name, value| Self::KEYS.contains(&name) || matches!(value, Value::Section(_))),
        })
    }
}

impl VolumeGroup {
    const KEYS: &'static [&'static str] = &[
        "id",
        "seqno",
        "format",
        "status",
        "flags",
        "tags",
        "extent_size",
        "max_lv",
        "max_pv",
        "metadata_copies",
        "physical_volumes",
        "logical_volumes",
    ];

    fn from_scope(scope: &Scope<'_>) -> Result<Self, Error> {
        let physical_volumes = scope
            .required_section("physical_volumes")?
            .children()?
            .iter()
            .map(PhysicalVolume::from_scope)
            .collect::<Result<Vec<_>, Error>>()?;
        let logical_volumes = match scope.optional_section("logical_volumes")? {
            Some(lvs) => lvs.children()?.iter().map(LogicalVolume::from_scope).collect::<Result<Vec<_>, Error>>()?,
            None => Vec::new(),
        };

        let extent_size: u64 = scope.required("extent_size")?;
        if extent_size.checked_mul(SECTOR_SIZE).is_none() {
            let problem = format!("{extent_size} sectors do not fit in 64 bits of bytes");
            return Err(scope.shape_error(Some("extent_size"), problem));
        }

        Ok(Self {
            name: scope.name(),
            id: scope.required("id")?,
            seqno: scope.required("seqno")?,
            format: scope.optional("format")?,
            status: scope.list("status")?,
            flags: scope.list("flags")?,
            tags: scope.list("tags")?,
            extent_size,
            max_lv: scope.optional("max_lv")?,
            max_pv: scope.optional("max_pv")?,
            metadata_copies: scope.optional("metadata_copies")?,
            physical_volumes,
            logical_volumes,
            properties: scope.properties(|name, _| Self::KEYS.contains(&name)),
        })
    }
}

impl PhysicalVolume {
    const KEYS: &'static [&'static str] =
        &["id", "device", "status", "flags", "tags", "dev_size", "pe_start", "pe_count", "ba_start", "ba_size"];

    fn from_scope(scope: &Scope<'_>) -> Result<Self, Error> {
        Ok(Self {
            name: scope.name(),
            id: scope.required("id")?,
            device: scope.optional("device")?,
            status: scope.list("status")?,
            flags: scope.list("flags")?,
            tags: scope.list("tags")?,
            dev_size: scope.optional("dev_size")?,
            pe_start: scope.required("pe_start")?,
            pe_count: scope.required("pe_count")?,
            ba_start: scope.optional("ba_start")?,
            ba_size: scope.optional("ba_size")?,
            properties: scope.properties(|name, _| Self::KEYS.contains(&name)),
        })
    }
}

impl LogicalVolume {
    const KEYS: &'static [&'static str] =
        &["id", "status", "flags", "tags", "creation_time", "creation_host", "segment_count"];

    fn from_scope(scope: &Scope<'_>) -> Result<Self, Error> {
        let segment_count: u64 = scope.required("segment_count")?;
        let mut segments = Vec::new();
        for index in 1..=segment_count {
            let segment = scope.required_section(&format!("segment{index}"))?;
            segments.push(Segment::from_scope(&segment)?);
        }

        let is_segment = |name: &str| {
            name.strip_prefix("segment")
                .and_then(|n| n.parse::<u64>().ok())
                .map_or(false, |n| (1..=segment_count).contains(&n))
        };

        Ok(Self {
            name: scope.name(),
            id: scope.required("id")?,
            status: scope.list("status")?,
            flags: scope.list("flags")?,
            tags: scope.list("tags")?,
            creation_time: scope.optional("creation_time")?,
            creation_host: scope.optional("creation_host")?,
            segments,
            properties: scope.properties(|name, _| Self::KEYS.contains(&name) || is_segment(name)),
        })
    }
}

impl Segment {
    const KEYS: &'static [&'static str] =
        &["start_extent", "extent_count", "type", "stripe_count", "stripe_size", "stripes", "tags"];

    fn from_scope(scope: &Scope<'_>) -> Result<Self, Error> {
        let stripes: Vec<StripeArea> = match scope.section.get("stripes") {
            None => Vec::new(),
            Some(Value::Array(items)) => {
                if items.len() % 2 != 0 {
                    return Err(scope.shape_error(
                        Some("stripes"),
                        format!("expected (physical volume, extent) pairs, found {} items", items.len()),
                    ));
                }
                items
                    .chunks(2)
                    .map(|pair| -> Result<_, Error> {
                        Ok(StripeArea {
                            physical_volume: scope.convert("stripes", &pair[0])?,
                            start_extent: scope.convert("stripes", &pair[1])?,
                        })
                    })
                    .collect::<Result<_, Error>>()?
            }
            Some(other) => {
                return Err(scope.shape_error(Some("stripes"), format!("expected an array, found {}", other.kind())))
            }
        };

        let stripe_count: Option<u64> = scope.optional("stripe_count")?;
        if stripe_count.map_or(false, |count| count != stripes.len() as u64) && !stripes.is_empty() {
            tracing::warn!(path = %scope.path, ?stripe_count, listed = stripes.len(), "stripe count disagrees with stripe list");
        }

        let start_extent: u64 = scope.required("start_extent")?;
        let extent_count: u64 = scope.required("extent_count")?;
        if start_extent.checked_add(extent_count).is_none() {
            return Err(scope.shape_error(
                Some("extent_count"),
                format!("{extent_count} extents from extent {start_extent} run past the largest extent number"),
            ));
        }

        Ok(Self {
            name: scope.name(),
            start_extent,
            extent_count,
            segment_type: scope.required("type")?,
            stripe_count,
            stripe_size: scope.optional("stripe_size")?,
            stripes,
            tags: scope.list("tags")?,
            properties: scope.properties(|name, _| Self::KEYS.contains(&name)),
        })
    }
}
