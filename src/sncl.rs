use crate::error::FederatorError;
use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::fmt;

/// FDSN timestamp format. `%.f` prints the fractional part only when it is
/// non-zero, so `2020-01-01T00:00:00` round-trips without a trailing dot.
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// A stream selector: network, station, location and channel codes.
/// Wildcards `*` and `?` are legal in every field; codes are ASCII and
/// case-preserving. The empty location is stored as `""` and rendered as
/// `--` on FDSN post lines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Stream {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
}

impl Stream {
    pub fn new(network: &str, station: &str, location: &str, channel: &str) -> Self {
        Self {
            network: network.to_string(),
            station: station.to_string(),
            location: if location == "--" {
                String::new()
            } else {
                location.to_string()
            },
            channel: channel.to_string(),
        }
    }

    /// Location code as written on an FDSN post line.
    pub fn location_or_dashes(&self) -> &str {
        if self.location.is_empty() {
            "--"
        } else {
            &self.location
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.network,
            self.station,
            self.location_or_dashes(),
            self.channel
        )
    }
}

/// A stream selector paired with a time interval `[start, end)`.
///
/// `end` may be open. Open epochs stay open on GET requests (to preserve
/// upstream cache hits) and are closed with the request's reference time
/// when a concrete range is required (POST bodies).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamEpoch {
    pub stream: Stream,
    pub starttime: NaiveDateTime,
    pub endtime: Option<NaiveDateTime>,
}

impl StreamEpoch {
    pub fn new(
        stream: Stream,
        starttime: NaiveDateTime,
        endtime: Option<NaiveDateTime>,
    ) -> Result<Self, FederatorError> {
        if let Some(end) = endtime {
            if end <= starttime {
                return Err(FederatorError::ClientInput(format!(
                    "endtime {} must be after starttime {}",
                    end.format(TIME_FORMAT),
                    starttime.format(TIME_FORMAT)
                )));
            }
        }
        Ok(Self {
            stream,
            starttime,
            endtime,
        })
    }

    /// Parse an FDSN post line: `NET STA LOC CHA START [END]`.
    ///
    /// A missing end token produces an open epoch unless `default_endtime`
    /// is supplied, in which case the epoch is closed with it.
    pub fn from_postline(
        line: &str,
        default_endtime: Option<NaiveDateTime>,
    ) -> Result<Self, FederatorError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 5 && fields.len() != 6 {
            return Err(FederatorError::ClientInput(format!(
                "invalid stream epoch line: {:?}",
                line
            )));
        }

        let stream = Stream::new(fields[0], fields[1], fields[2], fields[3]);
        let starttime = parse_timestamp(fields[4])?;
        let endtime = match fields.get(5) {
            Some(token) => Some(parse_timestamp(token)?),
            None => default_endtime,
        };

        Self::new(stream, starttime, endtime)
    }

    /// Serialize to an FDSN post line. Open epochs are closed with
    /// `default_endtime` when given, otherwise the end field is omitted.
    pub fn to_postline(&self, default_endtime: Option<NaiveDateTime>) -> String {
        let end = self.endtime.or(default_endtime);
        match end {
            Some(end) => format!(
                "{} {} {} {} {} {}",
                self.stream.network,
                self.stream.station,
                self.stream.location_or_dashes(),
                self.stream.channel,
                self.starttime.format(TIME_FORMAT),
                end.format(TIME_FORMAT)
            ),
            None => format!(
                "{} {} {} {} {}",
                self.stream.network,
                self.stream.station,
                self.stream.location_or_dashes(),
                self.stream.channel,
                self.starttime.format(TIME_FORMAT)
            ),
        }
    }
}

impl fmt::Display for StreamEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_postline(None))
    }
}

pub fn parse_timestamp(token: &str) -> Result<NaiveDateTime, FederatorError> {
    if let Ok(t) = NaiveDateTime::parse_from_str(token, TIME_FORMAT) {
        return Ok(t);
    }
    // Date-only form: midnight.
    if let Ok(d) = chrono::NaiveDate::parse_from_str(token, "%Y-%m-%d") {
        if let Some(t) = d.and_hms_opt(0, 0, 0) {
            return Ok(t);
        }
    }
    Err(FederatorError::ClientInput(format!(
        "invalid timestamp: {:?}",
        token
    )))
}

pub fn format_timestamp(t: NaiveDateTime) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// An endpoint URL paired with the stream epochs it will serve. Built by the
/// routing client, consumed by a request strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub url: String,
    pub streams: Vec<StreamEpoch>,
}

impl Route {
    pub fn new(url: &str, streams: Vec<StreamEpoch>) -> Self {
        Self {
            url: url.to_string(),
            streams,
        }
    }
}

/// Endpoint URL → resolved stream epochs, exactly as answered by the
/// resolver. A `BTreeMap` keeps iteration deterministic, which strategies
/// rely on to produce stable work lists.
pub type RoutingTable = BTreeMap<String, Vec<StreamEpoch>>;
