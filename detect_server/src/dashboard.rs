//! HTML dashboard served on `/`.
//!
use std::time::Duration;

use crate::context::AppContext;

const STYLE: &str = r#"
* { box-sizing: border-box; }
body {
    font-family: 'Segoe UI', Arial, sans-serif;
    margin: 0;
    padding: 20px;
    background: linear-gradient(135deg, #1a1a2e 0%, #16213e 100%);
    color: #e6e6e6;
    min-height: 100vh;
}
.container { max-width: 1200px; margin: 0 auto; }
h1 { color: #4CAF50; margin-bottom: 10px; font-size: 2em; }
.subtitle { color: #888; margin-bottom: 30px; }
.status-bar {
    background: #252540;
    padding: 15px 20px;
    border-radius: 8px;
    margin-bottom: 20px;
    display: flex;
    gap: 30px;
    flex-wrap: wrap;
}
.status-item { display: flex; align-items: center; gap: 8px; }
.status-dot { width: 10px; height: 10px; border-radius: 50%; background: #4CAF50; }
.video-container {
    background: #000;
    border-radius: 12px;
    overflow: hidden;
    margin-bottom: 20px;
}
.stream { width: 100%; max-width: 640px; display: block; }
.info-grid { display: grid; grid-template-columns: repeat(auto-fit, minmax(300px, 1fr)); gap: 20px; }
.info-card { background: #252540; border-radius: 8px; padding: 20px; }
.info-card h3 { color: #4CAF50; margin-top: 0; font-size: 1.1em; }
.info-card ul { list-style: none; padding: 0; margin: 0; }
.info-card li { padding: 8px 0; border-bottom: 1px solid #333; }
.info-card li:last-child { border-bottom: none; }
.info-card a { color: #64B5F6; text-decoration: none; }
code { background: #1a1a2e; padding: 2px 6px; border-radius: 4px; font-family: 'Consolas', monospace; }
"#;

/// Render the dashboard for the current state of the context.
pub fn render(context: &AppContext) -> String {
    let camera = context.camera.config();
    let model_name = context
        .model
        .as_ref()
        .and_then(|loaded| loaded.path.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "not loaded".into());
    let camera_state = if context.camera.is_running() {
        "running"
    } else {
        "idle"
    };

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>RockUGV Detection</title>
    <style>{STYLE}</style>
</head>
<body>
    <div class="container">
        <h1>RockUGV Border Surveillance</h1>
        <p class="subtitle">Real-Time Object Detection</p>

        <div class="status-bar">
            <div class="status-item"><div class="status-dot"></div><span>System Online</span></div>
            <div class="status-item"><span>Uptime: {uptime}</span></div>
            <div class="status-item"><span>Model: {model}</span></div>
            <div class="status-item"><span>Camera: {camera_state}</span></div>
        </div>

        <div class="video-container">
            <img class="stream" src="/video_feed" alt="Live Detection Feed">
        </div>

        <div class="info-grid">
            <div class="info-card">
                <h3>API Endpoints</h3>
                <ul>
                    <li><a href="/health">/health</a> - System health check</li>
                    <li><a href="/info">/info</a> - System information</li>
                    <li><a href="/video_feed">/video_feed</a> - Live MJPEG stream</li>
                    <li><a href="/snapshot">/snapshot</a> - Annotated snapshot</li>
                    <li><a href="/camera/status">/camera/status</a> - Camera state</li>
                    <li><code>POST /detect/image</code> - Detect objects in an image</li>
                    <li><code>POST /detect/video</code> - Detect objects in an MJPEG video</li>
                </ul>
            </div>

            <div class="info-card">
                <h3>Configuration</h3>
                <ul>
                    <li>Resolution: <code>{width}x{height}</code></li>
                    <li>Frame Rate: <code>{fps} FPS</code></li>
                    <li>Camera: <code>{device}</code></li>
                    <li>Confidence: <code>{confidence:.2}</code></li>
                </ul>
            </div>
        </div>
    </div>
</body>
</html>
"#,
        uptime = format_uptime(context.uptime()),
        model = escape(&model_name),
        width = camera.width,
        height = camera.height,
        fps = camera.fps,
        device = escape(&camera.device),
        confidence = context.settings.confidence,
    )
}

fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
