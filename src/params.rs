//! Query-parameter normalization for the exposed FDSN service families.
//!
//! GET requests carry selectors in the query string; POST requests carry
//! `key=value` option lines followed by one stream-epoch line per selector.
//! Both forms normalize into the same [`ParsedRequest`].

use crate::error::FederatorError;
use crate::fdsn::{Service, DEFAULT_NODATA};
use crate::sncl::{parse_timestamp, Stream, StreamEpoch};
use chrono::NaiveDateTime;
use std::collections::BTreeMap;

/// Selector keys merged into stream epochs rather than kept as options.
const SELECTOR_KEYS: &[&str] = &[
    "network",
    "station",
    "location",
    "channel",
    "starttime",
    "endtime",
];

const GENERAL_PARAMS: &[(&str, &[&str])] = &[
    ("starttime", &["starttime", "start"]),
    ("endtime", &["endtime", "end"]),
    ("network", &["network", "net"]),
    ("station", &["station", "sta"]),
    ("location", &["location", "loc"]),
    ("channel", &["channel", "cha"]),
    ("format", &["format"]),
    ("nodata", &["nodata"]),
    ("service", &["service"]),
];

const DATASELECT_PARAMS: &[(&str, &[&str])] = &[
    ("quality", &["quality"]),
    ("minimumlength", &["minimumlength"]),
    ("longestonly", &["longestonly"]),
];

const STATION_PARAMS: &[(&str, &[&str])] = &[
    ("minlatitude", &["minlatitude", "minlat"]),
    ("maxlatitude", &["maxlatitude", "maxlat"]),
    ("minlongitude", &["minlongitude", "minlon"]),
    ("maxlongitude", &["maxlongitude", "maxlon"]),
    ("latitude", &["latitude", "lat"]),
    ("longitude", &["longitude", "lon"]),
    ("minradius", &["minradius"]),
    ("maxradius", &["maxradius"]),
    ("level", &["level"]),
    ("includerestricted", &["includerestricted"]),
    ("includeavailability", &["includeavailability"]),
    ("updatedafter", &["updatedafter"]),
    ("matchtimeseries", &["matchtimeseries"]),
];

/// Earliest representable selector start. Station queries routinely omit
/// `starttime`; the resolver still needs a concrete lower bound.
fn epoch_floor() -> NaiveDateTime {
    chrono::NaiveDate::from_ymd_opt(1900, 1, 1)
        .expect("static date")
        .and_hms_opt(0, 0, 0)
        .expect("static time")
}

/// A normalized client request.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    /// Non-selector options under their canonical names (`format`, `level`,
    /// `quality`, ...). `nodata` and `service` never appear here.
    pub params: BTreeMap<String, String>,
    /// Resolved stream-epoch selectors (one per combination of the
    /// comma-separated code lists).
    pub stream_epochs: Vec<StreamEpoch>,
    pub nodata: u16,
}

impl ParsedRequest {
    pub fn format(&self) -> Option<&str> {
        self.params.get("format").map(String::as_str)
    }
}

fn canonical_name(service: Service, key: &str) -> Option<&'static str> {
    let extra: &[(&str, &[&str])] = match service {
        Service::Dataselect => DATASELECT_PARAMS,
        Service::Station => STATION_PARAMS,
        Service::WfCatalog => &[],
    };
    for (canonical, aliases) in GENERAL_PARAMS.iter().chain(extra.iter()) {
        if aliases.contains(&key) {
            return Some(canonical);
        }
    }
    None
}

fn validate_code(value: &str, key: &str) -> Result<(), FederatorError> {
    if value.is_empty() || !value.is_ascii() || value.contains(char::is_whitespace) {
        return Err(FederatorError::ClientInput(format!(
            "invalid {} code: {:?}",
            key, value
        )));
    }
    Ok(())
}

fn parse_nodata(value: Option<&String>) -> Result<u16, FederatorError> {
    match value {
        None => Ok(DEFAULT_NODATA),
        Some(v) => match v.parse::<u16>() {
            Ok(204) => Ok(204),
            Ok(404) => Ok(404),
            _ => Err(FederatorError::ClientInput(format!(
                "invalid nodata value: {:?}",
                v
            ))),
        },
    }
}

/// Expand comma-separated code lists into one epoch per combination.
fn build_epochs(
    selector: &BTreeMap<String, String>,
) -> Result<Vec<StreamEpoch>, FederatorError> {
    let field = |key: &str| -> Vec<String> {
        selector
            .get(key)
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_else(|| vec!["*".to_string()])
    };

    let networks = field("network");
    let stations = field("station");
    let locations = field("location");
    let channels = field("channel");

    let starttime = match selector.get("starttime") {
        Some(v) => parse_timestamp(v)?,
        None => epoch_floor(),
    };
    let endtime = match selector.get("endtime") {
        Some(v) => Some(parse_timestamp(v)?),
        None => None,
    };

    let mut epochs = Vec::new();
    for net in &networks {
        validate_code(net, "network")?;
        for sta in &stations {
            validate_code(sta, "station")?;
            for loc in &locations {
                validate_code(loc, "location")?;
                for cha in &channels {
                    validate_code(cha, "channel")?;
                    epochs.push(StreamEpoch::new(
                        Stream::new(net, sta, loc, cha),
                        starttime,
                        endtime,
                    )?);
                }
            }
        }
    }
    Ok(epochs)
}

/// Parse a GET query string.
pub fn parse_get(service: Service, query: &str) -> Result<ParsedRequest, FederatorError> {
    let mut options = BTreeMap::new();
    let mut selector = BTreeMap::new();

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        let canonical = canonical_name(service, &key).ok_or_else(|| {
            FederatorError::ClientInput(format!("unknown parameter: {:?}", key))
        })?;
        let target = if SELECTOR_KEYS.contains(&canonical) {
            &mut selector
        } else {
            &mut options
        };
        if target
            .insert(canonical.to_string(), value.to_string())
            .is_some()
        {
            return Err(FederatorError::ClientInput(format!(
                "duplicate parameter: {:?}",
                key
            )));
        }
    }

    let nodata = parse_nodata(options.remove("nodata").as_ref())?;
    // The service is fixed by the request path; a client-supplied value is
    // accepted and dropped (it is excluded from the cache fingerprint too).
    options.remove("service");
    let stream_epochs = build_epochs(&selector)?;

    Ok(ParsedRequest {
        params: options,
        stream_epochs,
        nodata,
    })
}

/// Parse an FDSN POST body: `key=value` option lines, then one stream-epoch
/// line per selector. At least one epoch line is required.
pub fn parse_post(service: Service, body: &str) -> Result<ParsedRequest, FederatorError> {
    let mut options = BTreeMap::new();
    let mut stream_epochs = Vec::new();

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let canonical = canonical_name(service, key).ok_or_else(|| {
                FederatorError::ClientInput(format!("unknown parameter: {:?}", key))
            })?;
            if SELECTOR_KEYS.contains(&canonical) {
                return Err(FederatorError::ClientInput(format!(
                    "selector parameter {:?} not allowed in POST body; use stream lines",
                    key
                )));
            }
            options.insert(canonical.to_string(), value.trim().to_string());
        } else {
            stream_epochs.push(StreamEpoch::from_postline(line, None)?);
        }
    }

    if stream_epochs.is_empty() {
        return Err(FederatorError::ClientInput(
            "POST body contains no stream epochs".to_string(),
        ));
    }

    let nodata = parse_nodata(options.remove("nodata").as_ref())?;
    options.remove("service");

    Ok(ParsedRequest {
        params: options,
        stream_epochs,
        nodata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_aliases_normalize() {
        let req = parse_get(
            Service::Dataselect,
            "net=GR&sta=WET&cha=BHZ&start=2020-01-01&end=2020-01-02&quality=B",
        )
        .unwrap();
        assert_eq!(req.stream_epochs.len(), 1);
        let epoch = &req.stream_epochs[0];
        assert_eq!(epoch.stream.network, "GR");
        assert_eq!(epoch.stream.location, "*");
        assert_eq!(req.params.get("quality").map(String::as_str), Some("B"));
        assert!(!req.params.contains_key("nodata"));
    }

    #[test]
    fn test_get_comma_lists_expand() {
        let req = parse_get(
            Service::Dataselect,
            "net=GR,CH&sta=WET&cha=BHZ,LHZ&start=2020-01-01T00:00:00",
        )
        .unwrap();
        assert_eq!(req.stream_epochs.len(), 4);
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let err = parse_get(Service::Dataselect, "net=GR&bogus=1").unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_station_param_not_valid_for_dataselect() {
        assert!(parse_get(Service::Dataselect, "minlatitude=10").is_err());
        assert!(parse_get(Service::Station, "minlatitude=10").is_ok());
    }

    #[test]
    fn test_nodata_validation() {
        assert_eq!(parse_get(Service::Station, "nodata=404").unwrap().nodata, 404);
        assert_eq!(parse_get(Service::Station, "").unwrap().nodata, 204);
        assert!(parse_get(Service::Station, "nodata=500").is_err());
    }

    #[test]
    fn test_post_body() {
        let body = "quality=B\n\nGR WET -- BHZ 2020-01-01T00:00:00 2020-01-02T00:00:00\nCH DAVOX 00 HHZ 2020-01-01T00:00:00 2020-01-02T00:00:00\n";
        let req = parse_post(Service::Dataselect, body).unwrap();
        assert_eq!(req.stream_epochs.len(), 2);
        assert_eq!(req.params.get("quality").map(String::as_str), Some("B"));
    }

    #[test]
    fn test_post_without_epochs_rejected() {
        assert!(parse_post(Service::Dataselect, "quality=B\n").is_err());
    }

    #[test]
    fn test_post_selector_option_rejected() {
        let body = "net=GR\nGR WET -- BHZ 2020-01-01T00:00:00 2020-01-02T00:00:00\n";
        assert!(parse_post(Service::Dataselect, body).is_err());
    }

    #[test]
    fn test_end_before_start_rejected() {
        assert!(parse_get(
            Service::Dataselect,
            "net=GR&start=2020-01-02T00:00:00&end=2020-01-01T00:00:00"
        )
        .is_err());
    }
}
