use std::sync::Arc;

use percent_encoding::percent_decode_str;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::http::engine::RequestEngine;
use crate::http::{HttpRequest, HttpResponse};

/// One page of a paginated REST resource. Following `next` / `first` / `last` issues a new request
///  through the same request engine, i.e. with the same host fallback policy.
pub struct PaginatedResult<T> {
    items: Vec<T>,
    current: HttpRequest,
    next: Option<HttpRequest>,
    first: Option<HttpRequest>,
    last: Option<HttpRequest>,
    engine: Arc<RequestEngine>,
}

impl <T> std::fmt::Debug for PaginatedResult<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PaginatedResult({} item(s) from {}, has_next: {})", self.items.len(), self.current.path, self.next.is_some())
    }
}

impl <T: DeserializeOwned> PaginatedResult<T> {
    pub(crate) async fn fetch(engine: Arc<RequestEngine>, request: HttpRequest) -> Result<PaginatedResult<T>> {
        let response = engine.execute(&request).await?;
        Self::from_response(engine, request, &response)
    }

    fn from_response(engine: Arc<RequestEngine>, request: HttpRequest, response: &HttpResponse) -> Result<PaginatedResult<T>> {
        let items = response.json::<Vec<T>>()?;
        let links = parse_links(&response.header_values("link"));
        Ok(PaginatedResult {
            items,
            next: links.get("next").and_then(|href| resolve_link(&request, href)),
            first: links.get("first").and_then(|href| resolve_link(&request, href)),
            last: links.get("last").and_then(|href| resolve_link(&request, href)),
            current: request,
            engine,
        })
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }

    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }

    pub fn is_last(&self) -> bool {
        !self.has_next()
    }

    /// the following page, `None` if this is the last one
    pub async fn next(&self) -> Result<Option<PaginatedResult<T>>> {
        match &self.next {
            Some(request) => Ok(Some(Self::fetch(self.engine.clone(), request.clone()).await?)),
            None => Ok(None),
        }
    }

    /// the first page, re-issuing the current request if the service did not send a `first` link
    pub async fn first(&self) -> Result<PaginatedResult<T>> {
        let request = self.first.clone()
            .unwrap_or_else(|| self.current.clone());
        Self::fetch(self.engine.clone(), request).await
    }

    /// the last page, `None` if the service did not send a `last` link
    pub async fn last(&self) -> Result<Option<PaginatedResult<T>>> {
        match &self.last {
            Some(request) => Ok(Some(Self::fetch(self.engine.clone(), request.clone()).await?)),
            None => Ok(None),
        }
    }
}

/// Parses `Link` header values of the form `<./messages?page=2>; rel="next"` into a map from
///  relation to link target. Several links may share one header value, separated by commas.
fn parse_links(values: &[&str]) -> FxHashMap<String, String> {
    let mut result = FxHashMap::default();
    for link in values.iter().flat_map(|v| v.split(',')) {
        let link = link.trim();
        let (target, attributes) = match link.strip_prefix('<').and_then(|l| l.split_once('>')) {
            Some(parts) => parts,
            None => continue,
        };
        for attribute in attributes.split(';') {
            if let Some(rel) = attribute.trim().strip_prefix("rel=") {
                for rel in rel.trim_matches('"').split_whitespace() {
                    result.insert(rel.to_string(), target.to_string());
                }
            }
        }
    }
    result
}

/// The request for a link target relative to `base`'s path
fn resolve_link(base: &HttpRequest, href: &str) -> Option<HttpRequest> {
    let (path, query) = match href.split_once('?') {
        Some((path, query)) => (path, query),
        None => (href, ""),
    };

    let path = if path.starts_with('/') {
        path.to_string()
    }
    else {
        let relative = path.strip_prefix("./").unwrap_or(path);
        let dir = match base.path.rfind('/') {
            Some(idx) => &base.path[..=idx],
            None => "/",
        };
        format!("{}{}", dir, relative)
    };

    let mut params = Vec::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        let k = percent_decode_str(k).decode_utf8().ok()?;
        let v = percent_decode_str(v).decode_utf8().ok()?;
        params.push((k.into_owned(), v.into_owned()));
    }

    Some(HttpRequest {
        method: base.method,
        path,
        params,
        headers: base.headers.clone(),
        body: None,
    })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::auth::KeyAuthenticator;
    use crate::http::{Method, MockHttpClient};
    use crate::protocol::Message;
    use crate::test_util::test_options;

    #[rstest]
    #[case::single(vec![r#"<./messages?page=2>; rel="next""#], vec![("next", "./messages?page=2")])]
    #[case::combined(vec![r#"<./m?p=1>; rel="first", <./m?p=3>; rel="next""#], vec![("first", "./m?p=1"), ("next", "./m?p=3")])]
    #[case::separate_headers(vec![r#"<./a>; rel="first""#, r#"<./b>; rel="current""#], vec![("current", "./b"), ("first", "./a")])]
    #[case::first_next_last(vec![r#"<./m?p=1>; rel="first", <./m?p=2>; rel="next", <./m?p=9>; rel="last""#], vec![("first", "./m?p=1"), ("last", "./m?p=9"), ("next", "./m?p=2")])]
    #[case::garbage(vec!["no link here"], vec![])]
    fn test_parse_links(#[case] values: Vec<&str>, #[case] expected: Vec<(&str, &str)>) {
        let mut links = parse_links(&values).into_iter().collect::<Vec<_>>();
        links.sort();
        let expected = expected.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<Vec<_>>();
        assert_eq!(links, expected);
    }

    #[rstest]
    #[case::relative("./messages?start=5&limit=2", "/channels/ch/messages", vec![("start", "5"), ("limit", "2")])]
    #[case::absolute("/stats?unit=hour", "/stats", vec![("unit", "hour")])]
    #[case::encoded("./messages?end=a%3Ab", "/channels/ch/messages", vec![("end", "a:b")])]
    #[case::no_query("./history", "/channels/ch/history", vec![])]
    fn test_resolve_link(#[case] href: &str, #[case] expected_path: &str, #[case] expected_params: Vec<(&str, &str)>) {
        let base = HttpRequest::new(Method::Get, "/channels/ch/messages").with_params(&[("limit", "2")]);
        let resolved = resolve_link(&base, href).unwrap();
        assert_eq!(resolved.path, expected_path);
        assert_eq!(resolved.params, expected_params.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_follow_next() {
        let mut client = MockHttpClient::new();
        client.expect_execute()
            .withf(|_, request| request.param("page").is_none())
            .times(1)
            .returning(|_, _| Ok(HttpResponse::new(200, r#"[{"name":"a"},{"name":"b"}]"#)
                .with_header("Link", r#"<./messages?page=2>; rel="next""#)));
        client.expect_execute()
            .withf(|_, request| request.path == "/channels/ch/messages" && request.param("page") == Some("2"))
            .times(1)
            .returning(|_, _| Ok(HttpResponse::new(200, r#"[{"name":"c"}]"#)));
        let engine = Arc::new(RequestEngine::new(&test_options(), Arc::new(client), Arc::new(KeyAuthenticator::new("app.key:secret"))));

        let page = PaginatedResult::<Message>::fetch(engine, HttpRequest::new(Method::Get, "/channels/ch/messages")).await.unwrap();
        assert_eq!(page.items().len(), 2);
        assert!(page.has_next());

        let last = page.next().await.unwrap().unwrap();
        assert_eq!(last.items()[0].name.as_deref(), Some("c"));
        assert!(last.is_last());
        assert!(last.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_follow_last() {
        let mut client = MockHttpClient::new();
        client.expect_execute()
            .withf(|_, request| request.param("page").is_none())
            .times(1)
            .returning(|_, _| Ok(HttpResponse::new(200, r#"[{"name":"a"}]"#)
                .with_header("Link", r#"<./messages?page=2>; rel="next", <./messages?page=7>; rel="last""#)));
        client.expect_execute()
            .withf(|host, request| host == "fallback1.test" && request.param("page") == Some("7"))
            .times(1)
            .returning(|_, _| Ok(HttpResponse::new(200, r#"[{"name":"z"}]"#)));
        client.expect_execute()
            .withf(|host, request| host == "rest.test" && request.param("page") == Some("7"))
            .times(1)
            .returning(|_, _| Ok(HttpResponse::new(503, "")));
        let engine = Arc::new(RequestEngine::new(&test_options(), Arc::new(client), Arc::new(KeyAuthenticator::new("app.key:secret"))));

        let page = PaginatedResult::<Message>::fetch(engine, HttpRequest::new(Method::Get, "/channels/ch/messages")).await.unwrap();
        // the last page is fetched with the same fallback policy
        let last = page.last().await.unwrap().unwrap();
        assert_eq!(last.items()[0].name.as_deref(), Some("z"));
        assert!(last.is_last());
        assert!(last.last().await.unwrap().is_none());
    }
}
