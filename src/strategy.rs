//! Request strategies: how a routing table becomes a work list.
//!
//! The four variants differ only in task granularity — per stream epoch,
//! per network as one bulk POST, adaptively (bulk with a combining fallback
//! for distributed networks), or one combining task per network. `route()`
//! is deterministic: two calls over the same table produce identical work
//! lists.

use crate::request::HttpMethod;
use crate::sncl::{Route, RoutingTable};
use crate::stats::ResponseCodeStats;
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStrategy {
    /// Every `(endpoint, stream epoch)` is its own task. Maximal
    /// parallelism, chosen when responses combine by concatenation.
    Granular,
    /// One POST per `(network, endpoint)` pair; GET is rewritten to POST
    /// because bulk selectors only fit a request body.
    NetworkBulk,
    /// Like `NetworkBulk`, but a network served by several endpoints is
    /// handed to a combining task that demultiplexes and re-merges it.
    AdaptiveNetworkBulk,
    /// Every network becomes one combining task regardless of endpoint
    /// count.
    NetworkCombining,
}

/// One unit of work produced by a strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    /// A single endpoint call.
    Single { route: Route, method: HttpMethod },
    /// A nested run owning routing and merging for one network.
    Combining {
        network: String,
        routes: Vec<Route>,
        method: HttpMethod,
    },
}

/// Split every route into one route per stream epoch, preserving table
/// order.
fn demux_routes(table: &RoutingTable) -> Vec<Route> {
    table
        .iter()
        .flat_map(|(url, epochs)| {
            epochs
                .iter()
                .map(|epoch| Route::new(url, vec![epoch.clone()]))
        })
        .collect()
}

/// Demultiplexed routes grouped by network code.
fn group_by_network(table: &RoutingTable) -> BTreeMap<String, Vec<Route>> {
    let mut grouped: BTreeMap<String, Vec<Route>> = BTreeMap::new();
    for route in demux_routes(table) {
        let net = route.streams[0].stream.network.clone();
        grouped.entry(net).or_default().push(route);
    }
    grouped
}

/// Per network, one multiplexed route per endpoint URL.
fn mux_by_network(table: &RoutingTable) -> BTreeMap<String, Vec<Route>> {
    let mut muxed: BTreeMap<String, Vec<Route>> = BTreeMap::new();
    for (net, routes) in group_by_network(table) {
        let mut by_url: BTreeMap<String, Vec<crate::sncl::StreamEpoch>> = BTreeMap::new();
        for route in routes {
            by_url
                .entry(route.url)
                .or_default()
                .extend(route.streams);
        }
        muxed.insert(
            net,
            by_url
                .into_iter()
                .map(|(url, epochs)| Route::new(&url, epochs))
                .collect(),
        );
    }
    muxed
}

impl RequestStrategy {
    /// Shape `table` into a work list. `method` is the caller's preferred
    /// endpoint method; bulk variants override it with POST.
    pub fn route(&self, table: &RoutingTable, method: HttpMethod) -> Vec<WorkItem> {
        match self {
            RequestStrategy::Granular => demux_routes(table)
                .into_iter()
                .map(|route| WorkItem::Single { route, method })
                .collect(),

            RequestStrategy::NetworkBulk => mux_by_network(table)
                .into_values()
                .flatten()
                .map(|route| WorkItem::Single {
                    route,
                    method: HttpMethod::Post,
                })
                .collect(),

            RequestStrategy::AdaptiveNetworkBulk => {
                let mut items = Vec::new();
                for (net, routes) in mux_by_network(table) {
                    if routes.len() == 1 {
                        let route = routes.into_iter().next().expect("len checked");
                        items.push(WorkItem::Single {
                            route,
                            method: HttpMethod::Post,
                        });
                    } else {
                        // Distributed network: demultiplex and let the
                        // combining task re-merge it.
                        let demuxed = routes
                            .into_iter()
                            .flat_map(|route| {
                                let url = route.url;
                                route
                                    .streams
                                    .into_iter()
                                    .map(move |epoch| Route::new(&url, vec![epoch]))
                            })
                            .collect();
                        items.push(WorkItem::Combining {
                            network: net,
                            routes: demuxed,
                            method,
                        });
                    }
                }
                items
            }

            RequestStrategy::NetworkCombining => group_by_network(table)
                .into_iter()
                .map(|(net, routes)| WorkItem::Combining {
                    network: net,
                    routes,
                    method,
                })
                .collect(),
        }
    }
}

/// Drop endpoints whose recent error ratio exceeds the per-client retry
/// budget (a percentage; `100` disables the gate). Runs once per strategy
/// invocation, before task creation. Stale reads are tolerated — a stats
/// failure admits the endpoint.
pub async fn filter_by_retry_budget(
    table: &mut RoutingTable,
    stats: &ResponseCodeStats,
    retry_budget_client: f64,
) {
    if retry_budget_client >= 100.0 {
        return;
    }

    let urls: Vec<String> = table.keys().cloned().collect();
    for url in urls {
        let ratio_percent = match stats.error_ratio(&url).await {
            Ok(ratio) => 100.0 * ratio,
            Err(e) => {
                warn!("strategy: error ratio unavailable, admitting url={}: {}", url, e);
                continue;
            }
        };
        if ratio_percent > retry_budget_client {
            debug!(
                "strategy: removing route due to exceeded client retry budget, url={} ({} > {})",
                url, ratio_percent, retry_budget_client
            );
            metrics::counter!(
                "federator_retry_budget_dropped_total",
                "url" => url.clone(),
            )
            .increment(1);
            table.remove(&url);
        }
    }
}
