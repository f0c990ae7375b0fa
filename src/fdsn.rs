//! FDSN web service conventions: path tokens, MIME types and error
//! documents shared by every service family the gateway exposes.

use http::StatusCode;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const STATION_PATH: &str = "/fdsnws/station/1";
pub const DATASELECT_PATH: &str = "/fdsnws/dataselect/1";
pub const WFCATALOG_PATH: &str = "/eidaws/wfcatalog/1";

pub const QUERY_METHOD: &str = "query";
pub const VERSION_METHOD: &str = "version";
pub const WADL_METHOD: &str = "application.wadl";

pub const MIMETYPE_MSEED: &str = "application/vnd.fdsn.mseed";
pub const MIMETYPE_XML: &str = "application/xml";
pub const MIMETYPE_TEXT: &str = "text/plain";
pub const MIMETYPE_JSON: &str = "application/json";

pub const DEFAULT_NODATA: u16 = 204;

/// The three service families the gateway federates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Station,
    Dataselect,
    WfCatalog,
}

impl Service {
    pub fn name(&self) -> &'static str {
        match self {
            Service::Station => "station",
            Service::Dataselect => "dataselect",
            Service::WfCatalog => "wfcatalog",
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            Service::Station => STATION_PATH,
            Service::Dataselect => DATASELECT_PATH,
            Service::WfCatalog => WFCATALOG_PATH,
        }
    }

    /// Result MIME type. Station answers `text/plain` only when the client
    /// explicitly requested `format=text`, XML otherwise.
    pub fn mimetype(&self, format: Option<&str>) -> &'static str {
        match self {
            Service::Dataselect => MIMETYPE_MSEED,
            Service::WfCatalog => MIMETYPE_JSON,
            Service::Station => {
                if format == Some("text") {
                    MIMETYPE_TEXT
                } else {
                    MIMETYPE_XML
                }
            }
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Render the canonical FDSN plain-text error document.
pub fn error_document(status: StatusCode, detail: &str, request_url: &str) -> String {
    let reason = status.canonical_reason().unwrap_or("Error");
    let now = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ");
    format!(
        "Error {code}: {reason}\n\n{detail}\n\nRequest:\n{url}\n\nRequest Submitted:\n{now}\n\nService version:\n{version}\n",
        code = status.as_u16(),
        reason = reason,
        detail = detail,
        url = request_url,
        now = now,
        version = VERSION,
    )
}

/// Static WADL document advertising the three methods of a service family.
pub fn wadl_document(service: Service) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<application xmlns="http://wadl.dev.java.net/2009/02">
  <resources base="{base}/">
    <resource path="query">
      <method name="GET"/>
      <method name="POST"/>
    </resource>
    <resource path="version">
      <method name="GET"/>
    </resource>
    <resource path="application.wadl">
      <method name="GET"/>
    </resource>
  </resources>
</application>
"#,
        base = service.path()
    )
}
