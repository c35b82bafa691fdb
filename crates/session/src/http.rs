//! The HTTP status surface
//!
//! Served on the wire port to anything that opens with `GET `: `/` is an
//! HTML table of every shard, backend and endpoint; `/monitor` is a
//! one-word verdict with diagnostic lines for probes; everything else is
//! a 404.

use std::fmt::Write as _;

use keel_engine::Runtime;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

use keel_backend::Result;

const CSS: &str = "<style type='text/css'><!--
body { font-family: sans-serif; }
tr.first td { padding-top: 0.5em; }
td { padding-right: 2em; }
th { text-align: left; }
tr.shard td { padding-top: 1em; padding-bottom: 0.5em; font-size: 120%; font-weight: bold; }
h1 { border-bottom: black 1px solid; }
--></style>";

/// Handle one request whose `GET ` prefix was already consumed
pub(crate) async fn serve(stream: &mut BufStream<TcpStream>, rt: &Runtime) -> Result<()> {
    // The next whitespace-terminated token is the path
    let mut raw = Vec::with_capacity(64);
    stream.read_until(b' ', &mut raw).await?;
    if raw.last() == Some(&b' ') {
        raw.pop();
    }
    let path = String::from_utf8_lossy(&raw);

    let (status, content_type, body) = match path.as_ref() {
        "/" => ("200", "text/html", show_shards(rt)),
        "/monitor" => ("200", "text/plain", show_monitor(rt)),
        _ => ("404", "text/plain", "Not found".to_owned()),
    };

    let mut response = String::with_capacity(body.len() + 128);
    let _ = write!(
        response,
        "HTTP/1.0 {status} \r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n{body}\r\n",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

fn show_monitor(rt: &Runtime) -> String {
    let status = crate::monitor::check_health(rt);
    let mut out = format!("{}\n", status.level());
    if status.messages().is_empty() {
        out.push_str("OK");
    } else {
        out.push_str(&status.messages().join("; "));
    }
    out.push('\n');
    out
}

fn show_shards(rt: &Runtime) -> String {
    let mut out = String::with_capacity(4096);
    out.push_str("<html><head><title>keel shards</title>");
    out.push_str(CSS);
    out.push_str("<body>");

    let status = crate::monitor::check_health(rt);
    if !status.messages().is_empty() {
        out.push_str("<h1>Issues</h1><ul>");
        for msg in status.messages() {
            let _ = write!(out, "<li>{msg}</li>");
        }
        out.push_str("</ul>");
    }

    out.push_str(
        "<h1>Shards</h1><table><tr class='header'>\
         <th class='leftspacer'>&nbsp;</th>\
         <th>Backend</th><th>Status</th><th>Lag</th>\
         <th>Address</th><th>RTT</th></tr>",
    );

    match rt.topology.get() {
        Ok(map) => {
            for shard in map.shards() {
                let _ = write!(
                    out,
                    "<tr class='shard'><td colspan='5'>{}</td></tr>",
                    shard.id()
                );
                for backend in shard.backends() {
                    let mut first = true;
                    for endpoint in backend.endpoints() {
                        if first {
                            let lag = shard
                                .replication_lag(backend)
                                .map(|l| format!("{} s", l.as_secs()))
                                .unwrap_or_else(|| "&mdash;".to_owned());
                            let _ = write!(
                                out,
                                "<tr class='first'><td class='leftspacer'>&nbsp;</td>\
                                 <td>{}</td><td>{}</td><td>{lag}</td>",
                                backend.addr(),
                                shard.backend_status_str(backend),
                            );
                            first = false;
                        } else {
                            out.push_str(
                                "<tr><td class='leftspacer'>&nbsp;</td>\
                                 <td></td><td></td><td></td>",
                            );
                        }
                        let rtt = endpoint
                            .roundtrip()
                            .map(|rt| format!("{} ms", rt.as_millis()))
                            .unwrap_or_else(|| "DEAD".to_owned());
                        let _ = write!(out, "<td>{}</td><td>{rtt}</td></tr>", endpoint.addr());
                    }
                }
            }
            out.push_str("</table>");
        }
        Err(_) => {
            out.push_str("<span style='color: red'>No shard config yet</span>");
        }
    }

    out.push_str("</body></html>");
    out
}
