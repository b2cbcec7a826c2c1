use crate::error::BrokerError;

/// Frame a payload as `<event-type>":"<body>`. The separator is a single
/// literal `:` byte; this is safe even though `body` may itself contain
/// `:` bytes, because `unframe` only ever splits on the first one.
pub fn frame(event_type: &str, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(event_type.len() + 1 + body.len());
    out.extend_from_slice(event_type.as_bytes());
    out.push(b':');
    out.extend_from_slice(body);
    out
}

/// Split a framed payload back into `(event_type, body)`. Fails with
/// `InvalidPayload` if there is no `:` separator.
pub fn unframe(payload: &[u8]) -> Result<(&str, &[u8]), BrokerError> {
    let pos = payload
        .iter()
        .position(|&b| b == b':')
        .ok_or(BrokerError::InvalidPayload)?;
    let (event_type, rest) = payload.split_at(pos);
    let body = &rest[1..];
    let event_type =
        std::str::from_utf8(event_type).map_err(|_| BrokerError::InvalidPayload)?;
    Ok((event_type, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let framed = frame("workflow_job", b"hello:world");
        assert_eq!(framed, b"workflow_job:hello:world");
        let (event_type, body) = unframe(&framed).unwrap();
        assert_eq!(event_type, "workflow_job");
        assert_eq!(body, b"hello:world");
    }

    #[test]
    fn missing_separator_is_invalid() {
        assert!(unframe(b"no-separator-here").is_err());
    }
}
