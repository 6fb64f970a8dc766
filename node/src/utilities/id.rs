use crate::network::Endpoint;
use crate::utilities::time::monotonic_secs;

pub(crate) type RequestId = String;

/// Request ids are unique per proposer per instant: prefix, subject endpoint
/// and a monotonic clock reading.
pub(crate) fn request_id(prefix: &str, subject: &Endpoint) -> RequestId {
    format!(
        "{}_{}_{}_{:.4}",
        prefix,
        subject.ip,
        subject.port,
        monotonic_secs()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_encodes_prefix_and_subject() {
        let subject = Endpoint::new("127.0.0.1", 6001);
        let id = request_id("reg", &subject);
        let clock = id.strip_prefix("reg_127.0.0.1_6001_").unwrap();
        assert!(clock.parse::<f64>().is_ok());
    }
}
