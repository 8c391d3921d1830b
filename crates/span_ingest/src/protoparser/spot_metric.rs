use super::{decode_json, ParseError, WireFormat};
use crate::model::{Metric, ORG_NAME_TAG};

/// Generic metric encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpotMetricFormat;

impl WireFormat for SpotMetricFormat {
    type Record = Metric;
    const NAME: &'static str = "spot_metric";

    fn decode(buf: &[u8]) -> Result<Metric, ParseError> {
        let mut metric: Metric = decode_json(Self::NAME, buf)?;
        if metric.name.is_empty() {
            return Err(ParseError::MissingField { field: "name" });
        }
        if metric.name.contains('-') {
            metric.name = metric.name.replace('-', "_");
        }
        if metric.org_name.is_empty() {
            if let Some(org) = metric.tags.get(ORG_NAME_TAG) {
                metric.org_name = org.clone();
            }
        }
        Ok(metric)
    }
}
