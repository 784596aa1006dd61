use std::collections::HashMap;

use crate::builtins::args;
use crate::http::{config_from_value, HttpServer};
use crate::value::Value;

pub fn register(globals: &mut HashMap<String, Value>) {
    globals.insert(
        "http_server".into(),
        Value::native("http_server", |eval, args| {
            let config = config_from_value(args.first().unwrap_or(&Value::Nil))?;
            let server = HttpServer::new(eval.interp().clone(), config);
            Ok(handle(server))
        }),
    );
}

/// Script-facing server handle: `route`, `unroute`, `static`, `start`.
fn handle(server: HttpServer) -> Value {
    let mut map = HashMap::new();

    let s = server.clone();
    map.insert(
        "route".to_string(),
        Value::native("route", move |_, args| {
            let method = args::string("route", args, 0)?;
            let path = args::string("route", args, 1)?;
            let handler = args::string("route", args, 2)?;
            s.register_route(method, path, handler)?;
            Ok(Value::Nil)
        }),
    );

    let s = server.clone();
    map.insert(
        "unroute".to_string(),
        Value::native("unroute", move |_, args| {
            let method = args::string("unroute", args, 0)?;
            let path = args::string("unroute", args, 1)?;
            Ok(Value::Bool(s.unregister(method, path)))
        }),
    );

    let s = server.clone();
    map.insert(
        "static".to_string(),
        Value::native("static", move |_, args| {
            let prefix = args::string("static", args, 0)?;
            let dir = args::string("static", args, 1)?;
            s.register_static(prefix, dir)?;
            Ok(Value::Nil)
        }),
    );

    let s = server.clone();
    map.insert(
        "routes".to_string(),
        Value::native("routes", move |_, _| Ok(Value::from(s.route_count()))),
    );

    let s = server;
    map.insert(
        "start".to_string(),
        Value::native("start", move |_, _| {
            s.start()?;
            Ok(Value::Nil)
        }),
    );

    Value::object(map)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::capabilities::Capabilities;
    use crate::config::Config;
    use crate::interpreter::Interpreter;
    use crate::value::Value;

    #[test]
    fn scripts_can_register_routes() {
        let interp = Interpreter::new(
            Config {
                script_dir: PathBuf::from("/app"),
                ..Config::default()
            },
            Capabilities::none(),
        );
        let out = interp
            .execute(
                "server = http_server({port: 0})\nserver.route(\"GET\", \"/u/:id\", \"h.du\")\nserver.static(\"/assets\", \"public\")\nserver.routes()",
            )
            .unwrap();
        // one pattern route plus the GET/HEAD static pair
        assert_eq!(out, Value::Num(3.0));
    }

    #[test]
    fn invalid_config_is_a_type_error() {
        let interp = Interpreter::new(Config::default(), Capabilities::none());
        let out = interp
            .execute("try http_server({port: \"not-a-port\"}) catch e e.kind end")
            .unwrap();
        assert_eq!(out, Value::Str("type_error".into()));
    }
}
