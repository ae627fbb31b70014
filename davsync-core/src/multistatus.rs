use std::borrow::Cow;

use quick_xml::Reader;
use quick_xml::events::Event;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::client::DavError;

/// Content type reported for collections.
pub const FOLDER_CONTENT_TYPE: &str = "DIR";

/// One resource as described by the server in a `multistatus` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Decoded path relative to the DAV root; folders end in `/`.
    pub path: String,
    /// Opaque version token with surrounding quotes removed.
    pub etag: String,
    pub length: u64,
    pub content_type: String,
    /// Milliseconds since the Unix epoch, `0` when the server did not report it.
    pub created_at: i64,
    pub modified_at: i64,
    pub remote_id: Option<String>,
    pub permissions: Option<String>,
}

impl RemoteFile {
    pub fn is_folder(&self) -> bool {
        self.content_type == FOLDER_CONTENT_TYPE
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFolder {
    pub folder: RemoteFile,
    pub children: Vec<RemoteFile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Href,
    Status,
    Etag,
    Length,
    ContentType,
    Created,
    Modified,
    Id,
    FileId,
    Permissions,
}

#[derive(Debug, Default)]
struct PropBuf {
    etag: Option<String>,
    length: Option<u64>,
    content_type: Option<String>,
    created: Option<String>,
    modified: Option<String>,
    id: Option<String>,
    file_id: Option<String>,
    permissions: Option<String>,
    collection: bool,
}

impl PropBuf {
    fn absorb(&mut self, other: PropBuf) {
        self.etag = other.etag.or(self.etag.take());
        self.length = other.length.or(self.length);
        self.content_type = other.content_type.or(self.content_type.take());
        self.created = other.created.or(self.created.take());
        self.modified = other.modified.or(self.modified.take());
        self.id = other.id.or(self.id.take());
        self.file_id = other.file_id.or(self.file_id.take());
        self.permissions = other.permissions.or(self.permissions.take());
        self.collection |= other.collection;
    }
}

#[derive(Debug, Default)]
struct ResponseBuf {
    href: Option<String>,
    props: PropBuf,
    /// Set once a propstat with status 200 was absorbed.
    found: bool,
}

/// Parses a `207 Multi-Status` body. `base_path` is the decoded path component of the
/// DAV root URL; it is stripped from every `href`.
pub fn parse_multistatus(xml: &str, base_path: &str) -> Result<Vec<RemoteFile>, DavError> {
    let mut reader = Reader::from_str(xml);

    let mut out = Vec::new();
    let mut response: Option<ResponseBuf> = None;
    let mut propstat: Option<PropBuf> = None;
    let mut propstat_ok = true;
    let mut field: Option<Field> = None;
    let mut text = String::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = e.local_name();
                match name.as_ref() {
                    b"response" => response = Some(ResponseBuf::default()),
                    b"propstat" => {
                        propstat = Some(PropBuf::default());
                        propstat_ok = true;
                    }
                    b"collection" => {
                        if let Some(props) = propstat.as_mut() {
                            props.collection = true;
                        }
                    }
                    other => {
                        field = field_for(other);
                        text.clear();
                    }
                }
            }
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"collection"
                    && let Some(props) = propstat.as_mut()
                {
                    props.collection = true;
                }
            }
            Event::Text(e) => {
                if field.is_some() {
                    text.push_str(&String::from_utf8_lossy(e.as_ref()));
                }
            }
            Event::GeneralRef(e) => {
                if field.is_some()
                    && let Some(resolved) = resolve_entity(e.as_ref())
                {
                    text.push(resolved);
                }
            }
            Event::End(e) => {
                let name = e.local_name();
                match name.as_ref() {
                    b"response" => {
                        if let Some(done) = response.take()
                            && done.found
                        {
                            out.push(finish_response(done, base_path)?);
                        }
                    }
                    b"propstat" => {
                        if let (Some(props), Some(resp)) = (propstat.take(), response.as_mut())
                            && propstat_ok
                        {
                            resp.props.absorb(props);
                            resp.found = true;
                        }
                    }
                    _ => {
                        if let Some(current) = field.take() {
                            let value = text.trim().to_string();
                            text.clear();
                            apply_field(
                                current,
                                value,
                                response.as_mut(),
                                propstat.as_mut(),
                                &mut propstat_ok,
                            );
                        }
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(out)
}

fn field_for(local_name: &[u8]) -> Option<Field> {
    match local_name {
        b"href" => Some(Field::Href),
        b"status" => Some(Field::Status),
        b"getetag" => Some(Field::Etag),
        b"getcontentlength" => Some(Field::Length),
        b"getcontenttype" => Some(Field::ContentType),
        b"creationdate" => Some(Field::Created),
        b"getlastmodified" => Some(Field::Modified),
        b"id" => Some(Field::Id),
        b"fileid" => Some(Field::FileId),
        b"permissions" => Some(Field::Permissions),
        _ => None,
    }
}

fn apply_field(
    field: Field,
    value: String,
    response: Option<&mut ResponseBuf>,
    propstat: Option<&mut PropBuf>,
    propstat_ok: &mut bool,
) {
    match field {
        Field::Href => {
            if let Some(resp) = response
                && resp.href.is_none()
            {
                resp.href = Some(value);
            }
        }
        // "HTTP/1.1 200 OK"; props under any other status are absent on the server.
        Field::Status => *propstat_ok = value.split_whitespace().nth(1) == Some("200"),
        other => {
            let Some(props) = propstat else {
                return;
            };
            match other {
                Field::Etag => props.etag = Some(value.trim_matches('"').to_string()),
                Field::Length => props.length = value.parse().ok(),
                Field::ContentType => props.content_type = Some(value),
                Field::Created => props.created = Some(value),
                Field::Modified => props.modified = Some(value),
                Field::Id => props.id = Some(value),
                Field::FileId => props.file_id = Some(value),
                Field::Permissions => props.permissions = Some(value),
                Field::Href | Field::Status => {}
            }
        }
    }
}

fn finish_response(done: ResponseBuf, base_path: &str) -> Result<RemoteFile, DavError> {
    let href = done
        .href
        .ok_or_else(|| DavError::Malformed("response without href".into()))?;
    let props = done.props;
    let mut path = relative_path(&href, base_path)?;
    if props.collection && !path.ends_with('/') {
        path.push('/');
    }
    let content_type = if props.collection {
        FOLDER_CONTENT_TYPE.to_string()
    } else {
        props
            .content_type
            .unwrap_or_else(|| "application/octet-stream".to_string())
    };

    Ok(RemoteFile {
        path,
        etag: props.etag.unwrap_or_default(),
        length: props.length.unwrap_or(0),
        content_type,
        created_at: props.created.as_deref().and_then(parse_rfc3339_ms).unwrap_or(0),
        modified_at: props
            .modified
            .as_deref()
            .and_then(parse_http_date_ms)
            .unwrap_or(0),
        remote_id: props.id.or(props.file_id),
        permissions: props.permissions,
    })
}

/// Turns an `href` (absolute URL or absolute path, percent-encoded) into a decoded path
/// relative to the DAV root.
pub(crate) fn relative_path(href: &str, base_path: &str) -> Result<String, DavError> {
    let raw_path = match href.find("://") {
        Some(scheme_end) => {
            let after = &href[scheme_end + 3..];
            after.find('/').map(|i| &after[i..]).unwrap_or("/")
        }
        None => href,
    };
    let decoded = decode(raw_path)?;
    let base = base_path.trim_end_matches('/');
    let rest = decoded
        .strip_prefix(base)
        .filter(|rest| rest.is_empty() || rest.starts_with('/'))
        .unwrap_or(&decoded);
    if rest.starts_with('/') {
        Ok(rest.to_string())
    } else {
        Ok(format!("/{rest}"))
    }
}

pub(crate) fn decode(value: &str) -> Result<String, DavError> {
    urlencoding::decode(value)
        .map(Cow::into_owned)
        .map_err(|_| DavError::Malformed(format!("href is not valid UTF-8: {value}")))
}

fn resolve_entity(name: &[u8]) -> Option<char> {
    match name {
        b"amp" => Some('&'),
        b"lt" => Some('<'),
        b"gt" => Some('>'),
        b"quot" => Some('"'),
        b"apos" => Some('\''),
        [b'#', b'x', hex @ ..] => std::str::from_utf8(hex)
            .ok()
            .and_then(|h| u32::from_str_radix(h, 16).ok())
            .and_then(char::from_u32),
        [b'#', dec @ ..] => std::str::from_utf8(dec)
            .ok()
            .and_then(|d| d.parse::<u32>().ok())
            .and_then(char::from_u32),
        _ => None,
    }
}

fn parse_rfc3339_ms(value: &str) -> Option<i64> {
    let parsed = OffsetDateTime::parse(value, &Rfc3339).ok()?;
    Some((parsed.unix_timestamp_nanos() / 1_000_000) as i64)
}

fn parse_http_date_ms(value: &str) -> Option<i64> {
    let parsed = httpdate::parse_http_date(value).ok()?;
    let since = parsed.duration_since(std::time::UNIX_EPOCH).ok()?;
    Some(since.as_millis() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns">
  <d:response>
    <d:href>/remote.php/webdav/docs/</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype><d:collection/></d:resourcetype>
        <d:getetag>"5f1a"</d:getetag>
        <d:getlastmodified>Mon, 01 Jan 2024 00:00:00 GMT</d:getlastmodified>
        <oc:id>00000007ocid</oc:id>
        <oc:permissions>RDNVCK</oc:permissions>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
    <d:propstat>
      <d:prop><d:getcontentlength/></d:prop>
      <d:status>HTTP/1.1 404 Not Found</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/remote.php/webdav/docs/Q%26A%20notes.txt</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype/>
        <d:getetag>"a1"</d:getetag>
        <d:getcontentlength>12</d:getcontentlength>
        <d:getcontenttype>text/plain</d:getcontenttype>
        <d:creationdate>2024-01-01T00:00:01Z</d:creationdate>
        <d:getlastmodified>Mon, 01 Jan 2024 00:00:02 GMT</d:getlastmodified>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
</d:multistatus>"#;

    #[test]
    fn parses_folder_and_child() {
        let entries = parse_multistatus(LISTING, "/remote.php/webdav").unwrap();
        assert_eq!(entries.len(), 2);

        let folder = &entries[0];
        assert_eq!(folder.path, "/docs/");
        assert!(folder.is_folder());
        assert_eq!(folder.etag, "5f1a");
        assert_eq!(folder.remote_id.as_deref(), Some("00000007ocid"));
        assert_eq!(folder.permissions.as_deref(), Some("RDNVCK"));
        assert_eq!(folder.modified_at, 1_704_067_200_000);

        let child = &entries[1];
        assert_eq!(child.path, "/docs/Q&A notes.txt");
        assert!(!child.is_folder());
        assert_eq!(child.length, 12);
        assert_eq!(child.content_type, "text/plain");
        assert_eq!(child.created_at, 1_704_067_201_000);
        assert_eq!(child.modified_at, 1_704_067_202_000);
    }

    #[test]
    fn relative_path_accepts_absolute_urls() {
        let path = relative_path("https://cloud.example/dav/a%20b/", "/dav").unwrap();
        assert_eq!(path, "/a b/");
    }

    #[test]
    fn relative_path_of_root_is_slash() {
        assert_eq!(relative_path("/dav/", "/dav/").unwrap(), "/");
        assert_eq!(relative_path("/dav", "/dav").unwrap(), "/");
    }

    #[test]
    fn relative_path_strips_base_only_at_segment_boundary() {
        assert_eq!(relative_path("/dav2/x", "/dav").unwrap(), "/dav2/x");
        assert_eq!(relative_path("/dav/x", "/dav").unwrap(), "/x");
    }

    #[test]
    fn responses_without_successful_propstat_are_skipped() {
        let xml = r#"<d:multistatus xmlns:d="DAV:">
        <d:response>
            <d:href>/dav/gone.txt</d:href>
            <d:status>HTTP/1.1 404 Not Found</d:status>
        </d:response>
        <d:response>
            <d:href>/dav/hidden.txt</d:href>
            <d:propstat><d:prop><d:getetag/></d:prop>
            <d:status>HTTP/1.1 403 Forbidden</d:status></d:propstat>
        </d:response>
        <d:response>
            <d:href>/dav/kept.txt</d:href>
            <d:propstat><d:prop><d:getetag>"k1"</d:getetag></d:prop>
            <d:status>HTTP/1.1 200 OK</d:status></d:propstat>
        </d:response></d:multistatus>"#;
        let entries = parse_multistatus(xml, "/dav").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "/kept.txt");
        assert_eq!(entries[0].etag, "k1");
    }

    #[test]
    fn resolves_entities_in_text() {
        let xml = r#"<d:multistatus xmlns:d="DAV:"><d:response>
            <d:href>/dav/a&amp;b.txt</d:href>
            <d:propstat><d:prop><d:getetag>&quot;x&quot;</d:getetag></d:prop>
            <d:status>HTTP/1.1 200 OK</d:status></d:propstat>
        </d:response></d:multistatus>"#;
        let entries = parse_multistatus(xml, "/dav").unwrap();
        assert_eq!(entries[0].path, "/a&b.txt");
        assert_eq!(entries[0].etag, "x");
    }
}
