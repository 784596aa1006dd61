use std::collections::HashMap;
use std::sync::Arc;

use mime::{APPLICATION_JSON, TEXT_HTML_UTF_8, TEXT_PLAIN_UTF_8};

use crate::builtins::args;
use crate::context::RequestContext;
use crate::error::Error;
use crate::eval::Signal;
use crate::http::jwt;
use crate::value::Value;

/// The parsed request handed to a handler worker: body read once and cached,
/// query and form already decoded.
#[derive(Debug, Default)]
pub struct RequestData {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub form: Vec<(String, String)>,
    pub body: String,
}

fn pairs_to_object(pairs: &[(String, String)]) -> Value {
    let map: HashMap<String, Value> = pairs
        .iter()
        .map(|(k, v)| (k.clone(), Value::Str(v.clone())))
        .collect();
    Value::object(map)
}

/// Build the mapping the `request()` helper returns.
pub fn request_value(ctx: &RequestContext) -> Value {
    let mut map = HashMap::new();
    if let Some(data) = &ctx.request {
        map.insert("method".to_string(), Value::Str(data.method.clone()));
        map.insert("path".to_string(), Value::Str(data.path.clone()));
        map.insert("headers".to_string(), pairs_to_object(&data.headers));
        map.insert("query".to_string(), pairs_to_object(&data.query));
        map.insert("form".to_string(), pairs_to_object(&data.form));
        map.insert("body".to_string(), Value::Str(data.body.clone()));
    }
    let params: HashMap<String, Value> = ctx
        .params
        .iter()
        .map(|(k, v)| (k.clone(), Value::Str(v.clone())))
        .collect();
    map.insert("params".to_string(), Value::object(params));
    if let Some(claims) = &ctx.jwt_claims {
        map.insert("jwt_claims".to_string(), claims.clone());
    }
    Value::object(map)
}

fn exit_response(
    status: f64,
    content_type: &str,
    body: String,
) -> Result<Value, Signal> {
    let mut headers = HashMap::new();
    headers.insert(
        "Content-Type".to_string(),
        Value::Str(content_type.to_string()),
    );
    let mut map = HashMap::new();
    map.insert("status".to_string(), Value::Num(status));
    map.insert("headers".to_string(), Value::object(headers));
    map.insert("body".to_string(), Value::Str(body));
    Err(Signal::Exit(Value::object(map)))
}

/// Build the `response()` helper object. Every method raises the exit
/// signal carrying the assembled response object, so response construction
/// unwinds to the handler boundary and goes through exactly one code path.
pub fn response_helper(ctx: Arc<RequestContext>, script_dir: &std::path::Path) -> Value {
    let mut map = HashMap::new();

    map.insert(
        "json".to_string(),
        Value::native("json", |_, args| {
            let value = args::any("json", args, 0)?;
            let status = args::opt_num("json", args, 1)?.unwrap_or(200.0);
            let body = serde_json::to_string(&value.to_json()).map_err(Error::from)?;
            exit_response(status, APPLICATION_JSON.as_ref(), body)
        }),
    );

    map.insert(
        "text".to_string(),
        Value::native("text", |_, args| {
            let body = args::string("text", args, 0)?.to_string();
            let status = args::opt_num("text", args, 1)?.unwrap_or(200.0);
            exit_response(status, TEXT_PLAIN_UTF_8.as_ref(), body)
        }),
    );

    map.insert(
        "html".to_string(),
        Value::native("html", |_, args| {
            let body = args::string("html", args, 0)?.to_string();
            let status = args::opt_num("html", args, 1)?.unwrap_or(200.0);
            exit_response(status, TEXT_HTML_UTF_8.as_ref(), body)
        }),
    );

    map.insert(
        "error".to_string(),
        Value::native("error", |_, args| {
            let message = args::string("error", args, 0)?.to_string();
            let status = args::opt_num("error", args, 1)?.unwrap_or(500.0);
            exit_response(status, TEXT_PLAIN_UTF_8.as_ref(), message)
        }),
    );

    map.insert(
        "redirect".to_string(),
        Value::native("redirect", |_, args| {
            let url = args::string("redirect", args, 0)?.to_string();
            let status = args::opt_num("redirect", args, 1)?.unwrap_or(302.0);
            let mut headers = HashMap::new();
            headers.insert("Location".to_string(), Value::Str(url));
            let mut map = HashMap::new();
            map.insert("status".to_string(), Value::Num(status));
            map.insert("headers".to_string(), Value::object(headers));
            Err(Signal::Exit(Value::object(map)))
        }),
    );

    let dir = script_dir.display().to_string();
    map.insert(
        "file".to_string(),
        Value::native("file", move |_, args| {
            let filename = args::string("file", args, 0)?.to_string();
            let status = args::opt_num("file", args, 1)?.unwrap_or(200.0);
            let mut map = HashMap::new();
            map.insert("status".to_string(), Value::Num(status));
            map.insert("filename".to_string(), Value::Str(filename));
            map.insert("scriptDir".to_string(), Value::Str(dir.clone()));
            Err(Signal::Exit(Value::object(map)))
        }),
    );

    map.insert(
        "response".to_string(),
        Value::native("response", |_, args| {
            Err(Signal::Exit(args.first().cloned().unwrap_or(Value::Nil)))
        }),
    );

    if let Some(secret) = ctx.jwt_secret.clone() {
        map.insert(
            "sign_jwt".to_string(),
            Value::native("sign_jwt", move |_, args| {
                let claims = args::any("sign_jwt", args, 0)?;
                if claims.as_object().is_none() {
                    return Err(Error::type_error("sign_jwt: claims must be an object").into());
                }
                // optional lifetime in seconds becomes an exp claim
                if let Some(expires_in) = args::opt_num("sign_jwt", args, 1)? {
                    let exp = chrono::Utc::now().timestamp() as f64 + expires_in;
                    let copy = claims.deep_copy();
                    if let Some(map) = copy.as_object() {
                        map.lock().insert("exp".to_string(), Value::Num(exp));
                    }
                    return Ok(Value::Str(jwt::sign(&secret, &copy)?));
                }
                Ok(Value::Str(jwt::sign(&secret, claims)?))
            }),
        );
    }

    Value::object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Frame, FrameReason};

    #[test]
    fn request_value_exposes_params_and_body() {
        let frame = Frame::new("/app/h.du", FrameReason::HttpRoute, "", None);
        let mut ctx = RequestContext::new(Value::Nil, frame);
        {
            let ctx = Arc::get_mut(&mut ctx).unwrap();
            ctx.params.insert("id".to_string(), "42".to_string());
            ctx.request = Some(Arc::new(RequestData {
                method: "GET".to_string(),
                path: "/u/42".to_string(),
                headers: vec![("accept".to_string(), "*/*".to_string())],
                query: vec![("page".to_string(), "2".to_string())],
                form: Vec::new(),
                body: String::new(),
            }));
        }
        let value = request_value(&ctx);
        let map = value.as_object().unwrap().lock().clone();
        assert_eq!(map["method"], Value::Str("GET".into()));
        let params = map["params"].as_object().unwrap().lock().clone();
        assert_eq!(params["id"], Value::Str("42".into()));
        let query = map["query"].as_object().unwrap().lock().clone();
        assert_eq!(query["page"], Value::Str("2".into()));
    }

    #[test]
    fn helpers_raise_the_exit_signal() {
        let frame = Frame::new("/app/h.du", FrameReason::HttpRoute, "", None);
        let ctx = RequestContext::new(Value::Nil, frame);
        let helper = response_helper(ctx, std::path::Path::new("/app"));
        let text = helper
            .as_object()
            .unwrap()
            .lock()
            .get("text")
            .cloned()
            .unwrap();

        let interp = crate::interpreter::Interpreter::new(
            crate::config::Config::default(),
            crate::capabilities::Capabilities::none(),
        );
        let mut eval = crate::eval::Evaluator::new(interp);
        match eval.call(&text, &[Value::Str("hi".into()), Value::Num(201.0)]) {
            Err(Signal::Exit(obj)) => {
                let map = obj.as_object().unwrap().lock().clone();
                assert_eq!(map["status"], Value::Num(201.0));
                assert_eq!(map["body"], Value::Str("hi".into()));
            }
            _ => panic!("expected exit signal"),
        }
    }

    #[test]
    fn sign_jwt_present_only_with_secret() {
        let frame = Frame::new("/app/h.du", FrameReason::HttpRoute, "", None);
        let ctx = RequestContext::new(Value::Nil, frame);
        let helper = response_helper(ctx.clone(), std::path::Path::new("/app"));
        assert!(helper.as_object().unwrap().lock().get("sign_jwt").is_none());

        let mut with_secret = RequestContext::new(Value::Nil, ctx.frame.clone());
        Arc::get_mut(&mut with_secret).unwrap().jwt_secret = Some("s".to_string());
        let helper = response_helper(with_secret, std::path::Path::new("/app"));
        assert!(helper.as_object().unwrap().lock().get("sign_jwt").is_some());
    }
}
