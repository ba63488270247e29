// Network collaborators used by the updater: an HTTP client and the realtime link

pub mod http;
pub mod realtime;

pub use http::{ByteSource, HttpClient, HttpRequest, HttpResponse, USER_AGENT};
pub use realtime::{NoRealtime, RealtimeLink};
