//! Minimal built-in viewer page. Real deployments embed noVNC; this page
//! opens the proxy stream with the token from its own query string and is
//! mostly useful for smoke-testing a session end to end.

use uuid::Uuid;

pub fn page(session_id: Uuid) -> String {
    format!(
        r#"<!doctype html>
<html>
<head>
  <meta charset="utf-8">
  <title>StreamSpace session {session_id}</title>
  <style>
    body {{ font-family: monospace; background: #111; color: #ddd; margin: 2rem; }}
    #status {{ margin-bottom: 1rem; }}
    #log {{ white-space: pre-wrap; }}
  </style>
</head>
<body>
  <div id="status">connecting…</div>
  <div id="log"></div>
  <script>
    const sessionId = "{session_id}";
    const token = new URLSearchParams(window.location.search).get("token");
    const status = document.getElementById("status");
    const log = document.getElementById("log");

    if (!token) {{
      status.textContent = "missing ?token= — mint one via POST /api/sessions/" + sessionId + "/vnc-token";
    }} else {{
      const proto = window.location.protocol === "https:" ? "wss" : "ws";
      const ws = new WebSocket(proto + "://" + window.location.host + "/vnc/" + sessionId + "?token=" + token);
      ws.binaryType = "arraybuffer";
      ws.onopen = () => {{ status.textContent = "connected"; }};
      ws.onmessage = (ev) => {{
        log.textContent += "<- " + ev.data.byteLength + " bytes\n";
      }};
      ws.onclose = (ev) => {{
        status.textContent = "closed: " + (ev.reason || "connection lost");
      }};
    }}
  </script>
</body>
</html>
"#
    )
}
