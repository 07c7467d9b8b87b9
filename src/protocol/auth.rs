use crate::protocol::codec;
use std::time::Duration;

/// Logon cadence. The server drops idle unauthenticated clients at roughly
/// 120 seconds, so the re-send period must stay below that.
pub const AUTH_INTERVAL: Duration = Duration::from_secs(115);

/// The XOR-masked logon payload, sent once on connect and every
/// [`AUTH_INTERVAL`] thereafter. The only bytes this client ever writes.
pub fn logon_message(email: &str) -> Vec<u8> {
    let text = format!("ByteBlast Client|NM-{}|V2", email.trim());
    codec::xor_mask(text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logon_is_masked_protocol_string() {
        let msg = logon_message("user@domain.com");
        let plain = codec::xor_mask(&msg);
        assert_eq!(plain, b"ByteBlast Client|NM-user@domain.com|V2");
    }

    #[test]
    fn logon_trims_email_whitespace() {
        assert_eq!(
            logon_message("  user@domain.com  "),
            logon_message("user@domain.com")
        );
    }

    #[test]
    fn cadence_beats_server_idle_cutoff() {
        assert!(AUTH_INTERVAL < Duration::from_secs(120));
        assert!(AUTH_INTERVAL >= Duration::from_secs(110));
    }
}
