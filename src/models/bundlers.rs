use serde::{Deserialize, Deserializer};

use crate::models::errors::ReferenceDataError;

pub const CHAIN_COLUMNS: [&str; 7] = [
    "ethereum",
    "polygon",
    "arbitrum",
    "optimism",
    "bnb",
    "avalanche",
    "base",
];

/// Static classification row used by reporting queries (joined on address).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundlerEntity {
    pub entity_name: String,
    pub address: String,
    /// One flag per entry of [`CHAIN_COLUMNS`], in that order.
    pub chains: [bool; 7],
}

/// One CSV row, read by position so header spelling does not matter.
#[derive(Debug, Deserialize)]
struct BundlerRow {
    entity_name: String,
    address: String,
    #[serde(deserialize_with = "flag")]
    ethereum: bool,
    #[serde(deserialize_with = "flag")]
    polygon: bool,
    #[serde(deserialize_with = "flag")]
    arbitrum: bool,
    #[serde(deserialize_with = "flag")]
    optimism: bool,
    #[serde(deserialize_with = "flag")]
    bnb: bool,
    #[serde(deserialize_with = "flag")]
    avalanche: bool,
    #[serde(deserialize_with = "flag")]
    base: bool,
}

impl From<BundlerRow> for BundlerEntity {
    fn from(row: BundlerRow) -> Self {
        Self {
            entity_name: row.entity_name,
            address: row.address,
            chains: [
                row.ethereum,
                row.polygon,
                row.arbitrum,
                row.optimism,
                row.bnb,
                row.avalanche,
                row.base,
            ],
        }
    }
}

fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = String::deserialize(deserializer)?;
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "yes" => Ok(true),
        "false" | "f" | "0" | "no" | "" => Ok(false),
        _ => Err(serde::de::Error::custom(format!("invalid boolean '{value}'"))),
    }
}

fn malformed(e: csv::Error) -> ReferenceDataError {
    ReferenceDataError::Malformed {
        line: e.position().map_or(0, |pos| pos.line() as usize),
        reason: e.to_string(),
    }
}

/// Parses the bundler reference file: a header line, then
/// `entity_name,address,<one flag per chain column>`. Quoted fields are supported and
/// blank lines are ignored.
pub fn parse_bundlers_csv(contents: &str) -> Result<Vec<BundlerEntity>, ReferenceDataError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(contents.as_bytes());

    let mut entities = Vec::new();
    for result in reader.records() {
        let record = result.map_err(malformed)?;
        let line = record.position().map_or(0, |pos| pos.line() as usize);
        if record.len() != 2 + CHAIN_COLUMNS.len() {
            return Err(ReferenceDataError::Malformed {
                line,
                reason: format!(
                    "expected {} fields, found {}",
                    2 + CHAIN_COLUMNS.len(),
                    record.len()
                ),
            });
        }
        let row: BundlerRow = record
            .deserialize(None)
            .map_err(|e| ReferenceDataError::Malformed {
                line,
                reason: e.to_string(),
            })?;
        entities.push(row.into());
    }

    Ok(entities)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "entity_name,address,ethereum,polygon,arbitrum,optimism,bnb,avalanche,base";

    #[test]
    fn test_parse_bundlers_csv() {
        let csv = format!(
            "{HEADER}\n\
             Biconomy,0xAbC,True,True,False,False,False,False,True\n\
             \n\
             Other,0x123,false,0,1,yes,no,f,t\n"
        );
        let entities = parse_bundlers_csv(&csv).unwrap();
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].entity_name, "Biconomy");
        assert_eq!(entities[0].address, "0xAbC");
        assert_eq!(entities[0].chains, [true, true, false, false, false, false, true]);
        assert_eq!(entities[1].chains, [false, false, true, true, false, false, true]);
    }

    #[test]
    fn test_quoted_name_with_comma() {
        let csv = format!(
            "{HEADER}\n\"Alchemy, Inc.\",0x4337001fff419768e088ce247456c1b892888084,TRUE,TRUE,FALSE,FALSE,FALSE,FALSE,TRUE\n"
        );
        let entities = parse_bundlers_csv(&csv).unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].entity_name, "Alchemy, Inc.");
        assert_eq!(
            entities[0].address,
            "0x4337001fff419768e088ce247456c1b892888084"
        );
        assert_eq!(entities[0].chains, [true, true, false, false, false, false, true]);
    }

    #[test]
    fn test_parse_bundlers_csv_reports_line() {
        let csv = format!("{HEADER}\nBiconomy,0xAbC,True\n");
        match parse_bundlers_csv(&csv) {
            Err(ReferenceDataError::Malformed { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected result: {other:?}"),
        }

        let csv = format!(
            "{HEADER}\nBiconomy,0xAbC,True,True,True,True,True,True,True\nOther,0x1,maybe,True,True,True,True,True,True\n"
        );
        match parse_bundlers_csv(&csv) {
            Err(ReferenceDataError::Malformed { line, reason }) => {
                assert_eq!(line, 3);
                assert!(reason.contains("maybe"), "{reason}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
