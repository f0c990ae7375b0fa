//! Client for the external routing resolver.
//!
//! The resolver answers a selector with a line-oriented body of blocks
//! separated by blank lines: an endpoint URL followed by one resolved
//! stream-epoch line per stream. The client parses that into a
//! [`RoutingTable`].

use crate::context::Context;
use crate::error::FederatorError;
use crate::fdsn::Service;
use crate::sncl::{format_timestamp, RoutingTable, StreamEpoch};
use chrono::NaiveDateTime;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct RoutingClient {
    http: reqwest::Client,
    url: String,
    timeout: std::time::Duration,
}

impl RoutingClient {
    pub fn new(http: reqwest::Client, url: String, timeout: std::time::Duration) -> Self {
        Self { http, url, timeout }
    }

    /// Resolve `epochs` into a routing table.
    ///
    /// The resolver is queried with GET when a single selector fits the
    /// URL, POST otherwise (and always when the client itself POSTed).
    /// On GET, open epochs stay open so a caching proxy in front of the
    /// resolver keeps its hits; on POST they are closed with
    /// `default_endtime` so endpoints receive concrete ranges.
    pub async fn resolve(
        &self,
        ctx: &Context,
        service: Service,
        epochs: &[StreamEpoch],
        post: bool,
        default_endtime: NaiveDateTime,
    ) -> Result<RoutingTable, FederatorError> {
        let use_post = post || epochs.len() > 1;
        info!(
            ctx = %ctx,
            "routing: fetching routes, url={}, service={}, post={}",
            self.url, service, use_post
        );

        let request = if use_post {
            let mut body = format!("service={}\nformat=post\n", service.name());
            for epoch in epochs {
                body.push_str(&epoch.to_postline(Some(default_endtime)));
                body.push('\n');
            }
            self.http.post(&self.url).body(body)
        } else {
            let epoch = match epochs.first() {
                Some(e) => e,
                None => return Err(FederatorError::NoData),
            };
            let mut query: Vec<(&str, String)> = vec![
                ("network", epoch.stream.network.clone()),
                ("station", epoch.stream.station.clone()),
                ("location", epoch.stream.location_or_dashes().to_string()),
                ("channel", epoch.stream.channel.clone()),
                ("starttime", format_timestamp(epoch.starttime)),
                ("service", service.name().to_string()),
                ("format", "post".to_string()),
            ];
            if let Some(end) = epoch.endtime {
                query.push(("endtime", format_timestamp(end)));
            }
            self.http.get(&self.url).query(&query)
        };

        let resp = request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| FederatorError::Routing(format!("resolver unreachable: {}", e)))?;

        let status = resp.status();
        metrics::counter!(
            "federator_routing_requests_total",
            "status_code" => status.as_u16().to_string(),
        )
        .increment(1);

        if status.as_u16() == 204 {
            warn!(ctx = %ctx, "routing: no routes for selector");
            return Err(FederatorError::NoData);
        }
        if !status.is_success() {
            return Err(FederatorError::Routing(format!(
                "resolver answered {}",
                status
            )));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| FederatorError::Routing(format!("resolver read failed: {}", e)))?;

        let table = parse_routing_response(&body, use_post.then_some(default_endtime))?;
        if table.is_empty() {
            warn!(ctx = %ctx, "routing: empty resolver response");
            return Err(FederatorError::NoData);
        }

        debug!(ctx = %ctx, "routing: number of routes received: {}", table.len());
        Ok(table)
    }
}

/// Parse the resolver's line-oriented response. `default_endtime` closes
/// open epochs (POST); `None` preserves them (GET).
pub fn parse_routing_response(
    body: &str,
    default_endtime: Option<NaiveDateTime>,
) -> Result<RoutingTable, FederatorError> {
    let mut table = RoutingTable::new();
    let mut current_url: Option<String> = None;
    let mut epochs: Vec<StreamEpoch> = Vec::new();

    let mut flush = |url: Option<String>, epochs: &mut Vec<StreamEpoch>| {
        if let Some(url) = url {
            if !epochs.is_empty() {
                table.entry(url).or_default().append(epochs);
            }
        }
    };

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            flush(current_url.take(), &mut epochs);
            continue;
        }
        match current_url {
            None => current_url = Some(line.to_string()),
            Some(_) => {
                let epoch = StreamEpoch::from_postline(line, default_endtime).map_err(|e| {
                    FederatorError::Routing(format!("malformed resolver response: {}", e))
                })?;
                epochs.push(epoch);
            }
        }
    }
    flush(current_url.take(), &mut epochs);

    Ok(table)
}
