//! Delivery status notification (RFC 3464) construction.
//!
//! When a queue entry finalizes with permanent per-recipient failures, the
//! queue builds a `multipart/report` message from these parts:
//! a human-readable summary, a machine-readable `message/delivery-status`
//! section, and the original message headers.

use chrono::Utc;
use std::fmt::Write;
use uuid::Uuid;

use crate::header::Header;
use crate::queue::{EntryMeta, FailedRcpt};

/// Assembled bounce message, split at the header/body seam the delivery
/// targets expect.
pub(crate) struct BounceMessage {
    pub header: Header,
    pub body: Vec<u8>,
}

pub(crate) fn generate_dsn(
    hostname: &str,
    entry: &EntryMeta,
    original_header: &Header,
) -> BounceMessage {
    let boundary = format!("=_{}", Uuid::new_v4().simple());

    let mut header = Header::new();
    header.append("Date", &Utc::now().to_rfc2822());
    header.append(
        "From",
        &format!("Mail Delivery Subsystem <MAILER-DAEMON@{hostname}>"),
    );
    header.append("To", &format!("<{}>", entry.mail_from));
    header.append("Subject", "Undelivered Mail Returned to Sender");
    header.append(
        "Message-ID",
        &format!("<{}@{hostname}>", Uuid::new_v4().simple()),
    );
    header.append("Auto-Submitted", "auto-replied");
    header.append("MIME-Version", "1.0");
    header.append(
        "Content-Type",
        &format!("multipart/report; report-type=delivery-status;\r\n\tboundary=\"{boundary}\""),
    );

    let mut body = String::new();
    let _ = write!(body, "This is a MIME-encapsulated message.\r\n\r\n");

    // human-readable part
    let _ = write!(
        body,
        "--{boundary}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         This is the mail system at host {hostname}.\r\n\
         \r\n\
         I'm sorry to have to inform you that your message could not\r\n\
         be delivered to one or more recipients.\r\n\
         \r\n"
    );
    for FailedRcpt { rcpt, status } in &entry.failed {
        let _ = write!(body, "<{rcpt}>: {status}\r\n");
    }
    let _ = write!(body, "\r\n");

    // machine-readable part
    let _ = write!(
        body,
        "--{boundary}\r\n\
         Content-Type: message/delivery-status\r\n\
         \r\n\
         Reporting-MTA: dns; {hostname}\r\n\
         Arrival-Date: {}\r\n",
        entry.queued_at.to_rfc2822()
    );
    for FailedRcpt { rcpt, status } in &entry.failed {
        let _ = write!(
            body,
            "\r\n\
             Final-Recipient: rfc822; {rcpt}\r\n\
             Action: failed\r\n\
             Status: {}\r\n\
             Diagnostic-Code: smtp; {status}\r\n\
             Last-Attempt-Date: {}\r\n",
            status.enhanced_code(),
            entry.last_attempt.to_rfc2822()
        );
    }
    let _ = write!(body, "\r\n");

    // original message headers
    let _ = write!(
        body,
        "--{boundary}\r\n\
         Content-Type: text/rfc822-headers\r\n\
         \r\n"
    );
    let original = original_header.to_bytes();
    body.push_str(&String::from_utf8_lossy(&original));
    let _ = write!(body, "--{boundary}--\r\n");

    BounceMessage {
        header,
        body: body.into_bytes(),
    }
}
