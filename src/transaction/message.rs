use super::{endpoint::EndpointInner, make_call_id, make_via_branch};
use crate::{rsip_ext::RsipResponseExt, transport::SipConnection, Error, Result};
use rsip::{
    headers::{ContentLength, Route},
    param::{OtherParam, Param},
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    Header, Request, Response, StatusCode,
};

impl EndpointInner {
    /// Builds a request with the mandatory headers in RFC 3261 order:
    /// Via, Call-ID, From, To, CSeq, Max-Forwards, User-Agent. Callers add
    /// Contact, bodies and anything else afterwards.
    pub fn make_request(
        &self,
        method: rsip::Method,
        req_uri: rsip::Uri,
        via: rsip::typed::Via,
        from: rsip::typed::From,
        to: rsip::typed::To,
        seq: u32,
    ) -> rsip::Request {
        let headers = vec![
            Header::Via(via.into()),
            Header::CallId(make_call_id(self.option.callid_suffix.as_deref())),
            Header::From(from.into()),
            Header::To(to.into()),
            Header::CSeq(rsip::typed::CSeq { seq, method }.into()),
            Header::MaxForwards(70.into()),
            Header::UserAgent(self.user_agent.clone().into()),
        ];
        rsip::Request {
            method,
            uri: req_uri,
            headers: headers.into(),
            body: vec![],
            version: rsip::Version::V2,
        }
    }

    /// Copies Via, Call-ID, From, To and CSeq from `req`. The To tag is the
    /// caller's business.
    pub fn make_response(
        &self,
        req: &Request,
        status_code: StatusCode,
        body: Option<Vec<u8>>,
    ) -> Response {
        let mut headers = req.headers.clone();
        headers.retain(|h| {
            matches!(
                h,
                Header::Via(_)
                    | Header::CallId(_)
                    | Header::From(_)
                    | Header::To(_)
                    | Header::CSeq(_)
            )
        });
        headers.push(Header::ContentLength(
            body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
        ));
        headers.unique_push(Header::UserAgent(self.user_agent.clone().into()));
        Response {
            status_code,
            version: req.version.clone(),
            headers,
            body: body.unwrap_or_default(),
        }
    }

    /// ACK for a 2xx. It is a transaction of its own: fresh branch, sent to
    /// the Contact of the response through the Record-Route set reversed.
    pub fn make_ack(&self, resp: &Response) -> Result<Request> {
        let uri = resp.remote_uri()?;

        let mut headers = resp.headers.clone();
        headers.retain(|h| {
            matches!(
                h,
                Header::CallId(_) | Header::From(_) | Header::To(_) | Header::CSeq(_)
            )
        });
        let mut via = resp.via_header()?.typed()?;
        via.params.retain(|p| !matches!(p, Param::Branch(_)));
        via.params.insert(0, make_via_branch());
        let mut route_set = resp
            .headers
            .iter()
            .filter_map(|h| match h {
                Header::RecordRoute(record_route) => {
                    Some(Header::Route(Route::from(record_route.value())))
                }
                _ => None,
            })
            .collect::<Vec<_>>();
        route_set.reverse();

        let mut request = Request {
            method: rsip::Method::Ack,
            uri,
            headers: vec![Header::Via(via.into())].into(),
            body: vec![],
            version: rsip::Version::V2,
        };
        request.headers.extend(headers.iter().cloned().collect::<Vec<_>>());
        request.headers.extend(route_set);
        self.finish_ack(request)
    }

    /// ACK for a 300-699 final. Same branch, Request-URI and Route set as
    /// the INVITE, To taken from the response.
    pub fn make_non2xx_ack(&self, original: &Request, resp: &Response) -> Result<Request> {
        let mut headers = original.headers.clone();
        headers.retain(|h| {
            matches!(
                h,
                Header::CallId(_) | Header::From(_) | Header::CSeq(_) | Header::Route(_)
            )
        });
        let mut request = Request {
            method: rsip::Method::Ack,
            uri: original.uri.clone(),
            headers: vec![
                Header::Via(original.via_header()?.clone()),
                Header::To(resp.to_header()?.clone()),
            ]
            .into(),
            body: vec![],
            version: rsip::Version::V2,
        };
        request.headers.extend(headers.iter().cloned().collect::<Vec<_>>());
        self.finish_ack(request)
    }

    fn finish_ack(&self, mut request: Request) -> Result<Request> {
        let cseq = request.cseq_header()?.seq()?;
        request.headers.unique_push(Header::CSeq(
            rsip::typed::CSeq {
                seq: cseq,
                method: rsip::Method::Ack,
            }
            .into(),
        ));
        request.headers.push(Header::MaxForwards(70.into()));
        request.headers.push(Header::ContentLength(ContentLength::default()));
        request
            .headers
            .unique_push(Header::UserAgent(self.user_agent.clone().into()));
        Ok(request)
    }

    /// CANCEL mirrors the INVITE it cancels: Request-URI, top Via, Call-ID,
    /// From, To, CSeq number and Route set.
    pub fn make_cancel(&self, original: &Request) -> Result<Request> {
        let cseq = original.cseq_header()?.seq()?;
        let mut headers = original.headers.clone();
        headers.retain(|h| {
            matches!(
                h,
                Header::CallId(_) | Header::From(_) | Header::To(_) | Header::Route(_)
            )
        });
        let mut request = Request {
            method: rsip::Method::Cancel,
            uri: original.uri.clone(),
            headers: vec![Header::Via(original.via_header()?.clone())].into(),
            body: vec![],
            version: rsip::Version::V2,
        };
        request.headers.extend(headers.iter().cloned().collect::<Vec<_>>());
        request.headers.push(Header::CSeq(
            rsip::typed::CSeq {
                seq: cseq,
                method: rsip::Method::Cancel,
            }
            .into(),
        ));
        request.headers.push(Header::MaxForwards(70.into()));
        request.headers.push(Header::ContentLength(ContentLength::default()));
        request
            .headers
            .unique_push(Header::UserAgent(self.user_agent.clone().into()));
        Ok(request)
    }

    /// Via for a request leaving through `connection`, or through the first
    /// bound transport when none is chosen yet.
    pub fn get_via(
        &self,
        connection: Option<&SipConnection>,
        branch: Option<Param>,
    ) -> Result<rsip::typed::Via> {
        let addr = match connection {
            Some(connection) => connection.get_addr().to_owned(),
            None => self
                .transport_layer
                .get_addrs()
                .first()
                .cloned()
                .ok_or_else(|| Error::EndpointError("no transport bound".to_string()))?,
        };
        Ok(rsip::typed::Via {
            version: rsip::Version::V2,
            transport: addr.r#type.unwrap_or(rsip::transport::Transport::Udp),
            uri: rsip::Uri {
                host_with_port: addr.addr,
                ..Default::default()
            },
            params: vec![
                branch.unwrap_or_else(make_via_branch),
                Param::Other(OtherParam::new("rport"), None),
            ],
        })
    }
}
