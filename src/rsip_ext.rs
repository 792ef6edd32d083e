use crate::transport::SipAddr;
use crate::{Error, Result};
use nom::{
    branch::alt,
    bytes::complete::{is_not, take_until},
    character::complete::{char, multispace0},
    combinator::{map, opt, rest},
    multi::separated_list0,
    sequence::{delimited, preceded},
    IResult, Parser,
};
use rsip::prelude::ToTypedHeader;
use rsip::prelude::{HeadersExt, UntypedHeader};
use tracing::warn;

/// Header names a caller may never override through a [`HeaderList`].
/// Compact forms are listed next to their long names.
const MANDATORY_HEADERS: &[&str] = &[
    "via",
    "v",
    "from",
    "f",
    "to",
    "t",
    "call-id",
    "i",
    "cseq",
    "max-forwards",
    "contact",
    "m",
    "content-length",
    "l",
];

/// Ordered, multi-valued header collection with case-insensitive names.
///
/// Insertion order is kept so headers serialize the way they were added,
/// lookups ignore it. The list is a plain value: handing it to a call
/// clones it, so a caller may keep mutating its own copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    entries: Vec<(String, String)>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.push((name.into(), value.into()));
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(name, value);
        self
    }

    pub fn get<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.get_all(name).next()
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Removes every value stored under `name`, returns how many were dropped.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_mandatory(name: &str) -> bool {
        MANDATORY_HEADERS
            .iter()
            .any(|m| m.eq_ignore_ascii_case(name.trim()))
    }

    /// Converts the list into wire headers. Entries naming a header the
    /// stack builds itself are dropped with a warning.
    pub fn to_headers(&self) -> Vec<rsip::Header> {
        self.entries
            .iter()
            .filter(|(name, value)| {
                if Self::is_mandatory(name) {
                    warn!(name, value, "dropping custom header that overrides a mandatory one");
                    false
                } else {
                    true
                }
            })
            .map(|(name, value)| rsip::Header::Other(name.clone(), value.clone()))
            .collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderList {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut list = HeaderList::new();
        for (k, v) in iter {
            list.push(k, v);
        }
        list
    }
}

pub trait RsipResponseExt {
    fn remote_uri(&self) -> Result<rsip::Uri>;
}

impl RsipResponseExt for rsip::Response {
    /// Target for requests inside the dialog this response establishes,
    /// taken from its Contact.
    fn remote_uri(&self) -> Result<rsip::Uri> {
        let contact = self.contact_header()?;
        let mut uri = extract_uri_from_contact(contact.value())?;
        uri.headers.clear();
        Ok(uri)
    }
}

/// Parses the URI out of a Contact value, tolerating parameters that the
/// strict parser refuses (quoted instance ids, feature tags).
pub fn extract_uri_from_contact(line: &str) -> Result<rsip::Uri> {
    if let Ok(uri) = rsip::headers::Contact::from(line).uri() {
        return Ok(uri);
    }

    let tokenizer = ContactTokenizer::from_str(line)?;
    let mut uri = rsip::Uri::try_from(tokenizer.uri()).map_err(Error::from)?;
    uri.params
        .retain(|p| !matches!(p, rsip::Param::Transport(rsip::Transport::Udp)));
    apply_tokenizer_params(&mut uri, &tokenizer);
    Ok(uri)
}

fn apply_tokenizer_params(uri: &mut rsip::Uri, tokenizer: &ContactTokenizer) {
    for (name, value) in tokenizer.params.iter().map(|p| (p.name, p.value)) {
        if name.eq_ignore_ascii_case("transport") {
            continue;
        }
        let mut updated = false;
        for param in uri.params.iter_mut() {
            if let rsip::Param::Other(key, existing_value) = param {
                if key.value().eq_ignore_ascii_case(name) {
                    *existing_value =
                        value.map(|v| rsip::param::OtherParamValue::new(v.to_string()));
                    updated = true;
                    break;
                }
            }
        }
        if !updated {
            uri.params.push(rsip::Param::Other(
                rsip::param::OtherParam::new(name),
                value.map(|v| rsip::param::OtherParamValue::new(v.to_string())),
            ));
        }
    }
}

/// Where a request goes next: its first Route, otherwise the Request-URI.
pub fn destination_from_request(request: &rsip::Request) -> Option<SipAddr> {
    request
        .headers
        .iter()
        .find_map(|header| match header {
            rsip::Header::Route(route) => route
                .typed()
                .ok()
                .and_then(|r| r.uris().first().and_then(|u| SipAddr::try_from(&u.uri).ok())),
            _ => None,
        })
        .or_else(|| SipAddr::try_from(&request.uri).ok())
}

#[derive(Debug)]
pub(crate) struct ContactTokenizer<'a> {
    uri: &'a str,
    params: Vec<ContactParamToken<'a>>,
}

#[derive(Debug)]
struct ContactParamToken<'a> {
    name: &'a str,
    value: Option<&'a str>,
}

impl<'a> ContactTokenizer<'a> {
    pub(crate) fn from_str(input: &'a str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::Error("empty contact header".into()));
        }

        match contact_tokenize(trimmed) {
            Ok((_rem, tokenizer)) => Ok(tokenizer),
            Err(_) => Ok(Self {
                uri: trimmed,
                params: contact_parse_params(trimmed),
            }),
        }
    }

    pub(crate) fn uri(&self) -> &'a str {
        self.uri
    }
}

fn contact_tokenize(input: &str) -> IResult<&str, ContactTokenizer<'_>> {
    alt((contact_with_brackets, contact_without_brackets)).parse(input)
}

fn contact_with_brackets(input: &str) -> IResult<&str, ContactTokenizer<'_>> {
    let (input, _) = multispace0(input)?;
    let (input, _) = opt(take_until("<")).parse(input)?;
    let (input, _) = char('<').parse(input)?;
    let (input, uri) = take_until(">").parse(input)?;
    let (input, _) = char('>').parse(input)?;

    let uri = uri.trim();
    let params = contact_parse_params(uri);
    Ok((input, ContactTokenizer { uri, params }))
}

fn contact_without_brackets(input: &str) -> IResult<&str, ContactTokenizer<'_>> {
    let (input, uri) = map(rest, |s: &str| s.trim()).parse(input)?;
    let params = contact_parse_params(uri);
    Ok((input, ContactTokenizer { uri, params }))
}

fn contact_parse_params(uri: &str) -> Vec<ContactParamToken<'_>> {
    let path = uri.split_once('?').map_or(uri, |(path, _)| path);
    let Some(idx) = path.find(';') else {
        return Vec::new();
    };
    let params_str = &path[idx + 1..];
    if params_str.is_empty() {
        return Vec::new();
    }
    match separated_list0(char(';'), contact_param).parse(params_str) {
        Ok((_, params)) => params.into_iter().filter(|p| !p.name.is_empty()).collect(),
        Err(_) => Vec::new(),
    }
}

fn contact_param(input: &str) -> IResult<&str, ContactParamToken<'_>> {
    let (input, _) = multispace0(input)?;
    let (input, name) = map(is_not("=; \t\r\n?"), |v: &str| v.trim()).parse(input)?;
    let (input, value) = opt(preceded(
        char('='),
        alt((
            delimited(char('"'), take_until("\""), char('"')),
            map(is_not("; \t\r\n?"), |v: &str| v.trim()),
        )),
    ))
    .parse(input)?;

    Ok((input, ContactParamToken { name, value }))
}
