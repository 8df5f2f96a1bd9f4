//! Target part definitions: flash geometry per supported MCU.
use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::flash::{FlashGeometry, Region};

/// MCU family, one YAML document per family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Family {
    pub name: String,
    pub description: String,
    pub parts: Vec<Part>,
}

/// One supported part and its flash geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    pub name: String,
    #[serde(deserialize_with = "parse_u32_field")]
    pub device_id: u32,
    #[serde(default, deserialize_with = "parse_u32_field")]
    pub aprom_base: u32,
    #[serde(deserialize_with = "parse_u32_field")]
    pub aprom_size: u32,
    #[serde(default, deserialize_with = "parse_u32_field")]
    pub data_flash_base: u32,
    #[serde(default, deserialize_with = "parse_u32_field")]
    pub data_flash_size: u32,
    #[serde(deserialize_with = "parse_u32_field")]
    pub page_size: u32,
}

impl ::std::fmt::Display for Part {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        write!(f, "{}(0x{:08x})", self.name, self.device_id)
    }
}

impl Part {
    pub fn geometry(&self) -> FlashGeometry {
        FlashGeometry {
            aprom: Region {
                base: self.aprom_base,
                size: self.aprom_size,
            },
            data_flash: Region {
                base: self.data_flash_base,
                size: self.data_flash_size,
            },
            page_size: self.page_size,
        }
    }
}

pub struct PartDb {
    pub families: Vec<Family>,
}

impl PartDb {
    pub fn load() -> Result<Self> {
        Ok(PartDb {
            families: vec![
                serde_yaml::from_str(include_str!("../devices/nuc126.yaml"))?,
                serde_yaml::from_str(include_str!("../devices/mini57.yaml"))?,
            ],
        })
    }

    /// Looks a part up by its name or by its family name (first variant).
    pub fn find(name: &str) -> Result<Part> {
        let db = PartDb::load()?;
        for family in &db.families {
            if family.name.eq_ignore_ascii_case(name) {
                return family
                    .parts
                    .first()
                    .cloned()
                    .ok_or_else(|| anyhow::format_err!("family {} has no parts", family.name));
            }
            if let Some(part) = family
                .parts
                .iter()
                .find(|p| p.name.eq_ignore_ascii_case(name))
            {
                return Ok(part.clone());
            }
        }
        anyhow::bail!("no part named {:?} in the device database", name)
    }
}

/// Accepts "0x1F000", "4K", "128KB" or plain decimal.
fn parse_u32_field<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let s: String = serde::Deserialize::deserialize(deserializer)?;
    let parsed = if let Some(hexpart) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hexpart, 16).ok()
    } else if let Some(kpart) = s
        .strip_suffix("KiB")
        .or_else(|| s.strip_suffix("KB"))
        .or_else(|| s.strip_suffix("K"))
    {
        kpart.parse::<u32>().ok().map(|v| v * 1024)
    } else {
        s.parse().ok()
    };
    parsed.ok_or_else(|| D::Error::custom(format!("cannot parse size/address {:?}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_parses_and_regions_do_not_overlap() {
        let db = PartDb::load().unwrap();
        assert!(!db.families.is_empty());
        for family in &db.families {
            for part in &family.parts {
                let g = part.geometry();
                assert!(g.page_size.is_power_of_two(), "{}", part);
                assert_eq!(g.aprom.size % g.page_size, 0, "{}", part);
                if g.data_flash.size != 0 {
                    assert!(
                        g.aprom.base + g.aprom.size <= g.data_flash.base,
                        "{}: data flash overlaps APROM",
                        part
                    );
                }
            }
        }
    }

    #[test]
    fn parts_are_found_by_part_or_family_name() {
        assert!(PartDb::find("NUC126").is_ok());
        assert!(PartDb::find("mini57").is_ok());
        assert!(PartDb::find("CH32V103").is_err());
    }
}
