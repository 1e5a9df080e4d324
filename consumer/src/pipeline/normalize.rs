//! Raw field map to canonical record mapping

use crate::message::{NormalizedRecord, RawMessage, Tags};

/// Optional raw attributes and the record field they are renamed to
const ATTRIBUTE_RENAMES: [(&str, Attribute); 3] = [
    ("detailsData", Attribute::Message),
    ("summaryData", Attribute::Summary),
    ("nagios_host", Attribute::MonitoringHost),
];

#[derive(Clone, Copy)]
enum Attribute {
    Message,
    Summary,
    MonitoringHost,
}

/// Build one record per comma-separated `serviceType` value
///
/// Returns an empty vector when a mandatory field is missing; callers
/// classify first, so this only happens for messages already `Malformed`.
pub fn normalize(raw: &RawMessage) -> Vec<NormalizedRecord> {
    let (Some(service_type), Some(timestamp), Some(hostname), Some(metric), Some(status)) = (
        raw.get_non_empty("serviceType"),
        raw.get_non_empty("timestamp"),
        raw.get_non_empty("hostName"),
        raw.get_non_empty("metricName"),
        raw.get_non_empty("metricStatus"),
    ) else {
        return Vec::new();
    };

    let mut template = NormalizedRecord {
        service: String::new(),
        timestamp: timestamp.to_string(),
        hostname: hostname.to_string(),
        metric: metric.to_string(),
        status: status.to_string(),
        message: None,
        summary: None,
        monitoring_host: None,
        tags: None,
    };

    for (key, attr) in ATTRIBUTE_RENAMES {
        let value = raw.get(key).map(String::from);
        match attr {
            Attribute::Message => template.message = value,
            Attribute::Summary => template.summary = value,
            Attribute::MonitoringHost => template.monitoring_host = value,
        }
    }

    let tags = Tags {
        roc: raw.get("ROC").map(String::from),
        vo_name: raw.get("voName").map(String::from),
        vo_fqan: raw.get("voFqan").map(String::from),
    };
    if !tags.is_empty() {
        template.tags = Some(tags);
    }

    service_type
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|service| NormalizedRecord {
            service: service.to_string(),
            ..template.clone()
        })
        .collect()
}
