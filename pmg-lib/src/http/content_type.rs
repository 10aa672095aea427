use rama::http::{
    headers::{Accept, ContentType},
    mime,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Well-known content types we generate block responses for.
pub enum KnownContentType {
    Json,
    Html,
    Txt,
    Xml,
}

impl KnownContentType {
    /// Pick the best matching known type from an Accept header.
    pub fn detect_from_accept_header(accept: Accept) -> Option<Self> {
        let mut sorted_accept = accept;
        sorted_accept.sort_quality_values();

        sorted_accept
            .0
            .iter()
            .find_map(|qv| Self::from_subtype(qv.value.subtype()))
    }

    /// Classify a response Content-Type header.
    pub fn detect_from_content_type_header(content_type: ContentType) -> Option<Self> {
        let mime: mime::Mime = content_type.into();
        Self::from_subtype(mime.subtype())
    }

    fn from_subtype(subtype: mime::Name<'_>) -> Option<Self> {
        if subtype == mime::JSON {
            Some(Self::Json)
        } else if subtype == mime::HTML {
            Some(Self::Html)
        } else if subtype == mime::TEXT {
            Some(Self::Txt)
        } else if subtype == mime::XML {
            Some(Self::Xml)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use rama::http::{HeaderValue, headers::HeaderDecode};

    use super::*;

    #[test]
    fn test_detect_from_accept_header() {
        for (header_value, expected_result) in [
            (
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
                Some(KnownContentType::Html),
            ),
            ("text/html", Some(KnownContentType::Html)),
            ("application/xml", Some(KnownContentType::Xml)),
            (
                "text/html;q=0.8,application/xml",
                Some(KnownContentType::Xml),
            ),
            (
                "text/html;q=0.8,application/json;q=0.9,plain/text,application/xml",
                Some(KnownContentType::Txt),
            ),
            ("plain/text", Some(KnownContentType::Txt)),
            ("plain/text; charset=utf8", Some(KnownContentType::Txt)),
            ("application/octet-stream", None),
        ] {
            let accept =
                Accept::decode(&mut [&HeaderValue::from_static(header_value)].into_iter()).unwrap();
            let maybe_ct = KnownContentType::detect_from_accept_header(accept.clone());
            assert_eq!(
                maybe_ct, expected_result,
                "header value: {header_value}; parsed qvs: {:?}",
                accept.0
            );
        }
    }
}
