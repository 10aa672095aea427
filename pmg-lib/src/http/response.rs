use rama::http::{
    Request, Response, StatusCode,
    headers::{self, HeaderMapExt as _},
    service::web::response::{Headers, IntoResponse},
};

use crate::analysis::AnalysisResult;

use super::KnownContentType;

const CONTACT_ADMIN_MESSAGE: &str = "Contact your security administrator for more information.";
const MALWARE_BLOCKED_MESSAGE: &str =
    "This download was blocked because it was identified as malware.";

const BLOCKED_STATUS_CODE: StatusCode = StatusCode::FORBIDDEN;

/// One-line coordinate + reason + reference rendering shared by every
/// payload flavor, so the essentials survive whatever Accept header the
/// client sent.
fn describe_blocked_result(result: &AnalysisResult) -> String {
    let mut description = format!(
        "Package {} ({}) version {} was identified as malware.",
        result.package.name(),
        result.package.ecosystem(),
        if result.package.is_resolved() {
            result.package.version()
        } else {
            "<unresolved>"
        },
    );
    if !result.summary.is_empty() {
        description.push_str(&format!(" Reason: {}.", result.summary));
    }
    if !result.reference_url.is_empty() {
        description.push_str(&format!(" Reference: {}", result.reference_url));
    }
    description
}

fn html_blocked_payload(message: &str) -> String {
    format!(
        r##"<!doctype html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width,initial-scale=1">
    <title>Blocked</title>
</head>
<body>
    <h1>Request blocked</h1>
    <p>{MALWARE_BLOCKED_MESSAGE}</p>
    <p>{message}</p>
    <p>{CONTACT_ADMIN_MESSAGE}</p>
</body>
</html>
"##
    )
}

fn txt_blocked_payload(message: &str) -> String {
    format!("{MALWARE_BLOCKED_MESSAGE}\n{message}\n{CONTACT_ADMIN_MESSAGE}\n")
}

fn json_blocked_payload(result: &AnalysisResult) -> String {
    serde_json::json!({
        "error": "blocked",
        "message": MALWARE_BLOCKED_MESSAGE,
        "ecosystem": result.package.ecosystem().to_string(),
        "package": result.package.name(),
        "version": result.package.version(),
        "reason": result.summary.as_str(),
        "reference_url": result.reference_url.as_str(),
        "action": CONTACT_ADMIN_MESSAGE,
    })
    .to_string()
}

fn xml_blocked_payload(message: &str) -> String {
    format!(
        r##"<?xml version="1.0" encoding="UTF-8"?>
<response>
    <error>blocked</error>
    <message>{MALWARE_BLOCKED_MESSAGE}</message>
    <detail>{message}</detail>
    <action>{CONTACT_ADMIN_MESSAGE}</action>
</response>"##
    )
}

/// Generate the 403 returned in place of a malicious artifact download.
///
/// The body always names the ecosystem, coordinate, reason and reference URL;
/// the flavor follows the client's Accept header, defaulting to plain text.
pub fn generate_malware_blocked_response_for_req(
    req: &Request,
    result: &AnalysisResult,
) -> Response {
    let maybe_detected_ct = req
        .headers()
        .typed_get()
        .and_then(KnownContentType::detect_from_accept_header);

    let message = describe_blocked_result(result);

    match maybe_detected_ct {
        Some(KnownContentType::Html) => generate_blocked_response_for_payload(
            headers::ContentType::html_utf8(),
            html_blocked_payload(&message),
        ),
        Some(KnownContentType::Json) => generate_blocked_response_for_payload(
            headers::ContentType::json(),
            json_blocked_payload(result),
        ),
        Some(KnownContentType::Xml) => generate_blocked_response_for_payload(
            headers::ContentType::xml(),
            xml_blocked_payload(&message),
        ),
        // plain text for Txt and for unknown clients (package managers
        // rarely send a useful Accept header on tarball downloads)
        Some(KnownContentType::Txt) | None => generate_blocked_response_for_payload(
            headers::ContentType::text_utf8(),
            txt_blocked_payload(&message),
        ),
    }
}

fn generate_blocked_response_for_payload(
    ct: headers::ContentType,
    body: impl IntoResponse,
) -> Response {
    (BLOCKED_STATUS_CODE, Headers::single(ct), body).into_response()
}
