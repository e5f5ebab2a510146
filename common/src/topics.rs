pub const TOPIC_INBOUND: &str = "ToAndroid";
pub const TOPIC_OUTBOUND: &str = "FromAndroid";

pub const DEFAULT_CLIENT_ID: &str = "powerstrip-client";
pub const DEFAULT_GREETING: &str = "Hello from powerstrip client";
