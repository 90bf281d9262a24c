//! MIME type lookup by file extension.

/// Ordered extension table; earlier entries win when extensions collide.
/// Deliberately small: embedded deployments serve a known set of assets.
const TABLE: &[(&str, &str)] = &[
    ("txt", "text/plain"),
    ("log", "text/plain"),
    ("js", "text/javascript"),
    ("css", "text/css"),
    ("htm", "text/html"),
    ("html", "text/html"),
    ("diff", "text/x-patch"),
    ("patch", "text/x-patch"),
    ("c", "text/x-csrc"),
    ("h", "text/x-chdr"),
    ("o", "text/x-object"),
    ("ko", "text/x-object"),
    ("bmp", "image/bmp"),
    ("gif", "image/gif"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("svg", "image/svg+xml"),
    ("json", "application/json"),
    ("jsonld", "application/ld+json"),
    ("zip", "application/zip"),
    ("pdf", "application/pdf"),
    ("xml", "application/xml"),
    ("xsl", "application/xml"),
    ("doc", "application/msword"),
    ("ppt", "application/vnd.ms-powerpoint"),
    ("xls", "application/vnd.ms-excel"),
    ("odt", "application/vnd.oasis.opendocument.text"),
    ("odp", "application/vnd.oasis.opendocument.presentation"),
    ("pl", "application/x-perl"),
    ("sh", "application/x-shellscript"),
    ("php", "application/x-php"),
    ("deb", "application/x-deb"),
    ("iso", "application/x-cd-image"),
    ("tar.gz", "application/x-compressed-tar"),
    ("tgz", "application/x-compressed-tar"),
    ("gz", "application/x-gzip"),
    ("tar.bz2", "application/x-bzip-compressed-tar"),
    ("tbz", "application/x-bzip-compressed-tar"),
    ("bz2", "application/x-bzip"),
    ("tar", "application/x-tar"),
    ("rar", "application/x-rar-compressed"),
    ("mp3", "audio/mpeg"),
    ("ogg", "audio/x-vorbis+ogg"),
    ("wav", "audio/x-wav"),
    ("mp4", "video/mp4"),
    ("mpeg", "video/mpeg"),
    ("mpg", "video/mpeg"),
    ("avi", "video/x-msvideo"),
    ("ico", "image/x-icon"),
];

pub const FALLBACK: &str = "application/octet-stream";

/// Guesses a MIME type from the extension: the bytes after the last `.` in
/// the final path component, compared case-insensitively against the table.
/// Multi-part extensions (`.tar.gz`) are tried against the longest suffix
/// each table entry describes.
pub fn from_path(path: &[u8]) -> &'static str {
    // Scan right to left; stop at the component boundary.
    let stop = path
        .iter()
        .rposition(|&b| b == b'/')
        .map(|p| p + 1)
        .unwrap_or(0);
    let file = &path[stop..];

    let Some(dot) = file.iter().rposition(|&b| b == b'.') else {
        return FALLBACK;
    };
    if dot + 1 >= file.len() {
        return FALLBACK;
    }

    for &(ext, mime) in TABLE {
        let ext = ext.as_bytes();
        // Either the plain last extension, or a dotted suffix of the whole
        // file name for entries like "tar.gz".
        if file[dot + 1..].eq_ignore_ascii_case(ext) {
            return mime;
        }
        if ext.contains(&b'.')
            && file.len() > ext.len()
            && file[file.len() - ext.len() - 1] == b'.'
            && file[file.len() - ext.len()..].eq_ignore_ascii_case(ext)
        {
            return mime;
        }
    }
    FALLBACK
}
