pub(super) const DASHBOARD_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1" />
  <title>Queues</title>
  <style>
    :root {
      color-scheme: light;
      --bg: #f6f7fb;
      --panel: #ffffff;
      --border: #d7dbe6;
      --text: #1b1f2a;
      --muted: #5b6275;
      --accent: #1f6feb;
      --danger: #c93c37;
    }
    * { box-sizing: border-box; }
    body {
      margin: 0;
      font-family: "Segoe UI", "Helvetica Neue", Arial, sans-serif;
      background: var(--bg);
      color: var(--text);
    }
    header {
      padding: 20px 24px;
      border-bottom: 1px solid var(--border);
      background: var(--panel);
    }
    h1 { margin: 0; font-size: 20px; }
    main {
      padding: 16px 24px 32px;
      display: grid;
      gap: 16px;
      grid-template-columns: repeat(auto-fit, minmax(320px, 1fr));
    }
    section {
      background: var(--panel);
      border: 1px solid var(--border);
      border-radius: 10px;
      padding: 12px 14px;
      box-shadow: 0 1px 2px rgba(0,0,0,0.04);
    }
    section.dlq { border-color: var(--danger); }
    h2 { margin: 0 0 8px; font-size: 16px; }
    .muted { color: var(--muted); font-size: 12px; }
    table { width: 100%; border-collapse: collapse; font-size: 13px; }
    td { padding: 3px 0; }
    td.n { text-align: right; font-variant-numeric: tabular-nums; }
    select, button {
      margin-top: 8px;
      padding: 6px 10px;
      border: 1px solid var(--border);
      border-radius: 6px;
      font-family: inherit;
    }
    button { border-color: var(--accent); background: var(--accent); color: white; cursor: pointer; }
    pre {
      margin: 10px 0 0;
      padding: 10px;
      background: #0f172a;
      color: #e5e7eb;
      border-radius: 8px;
      font-size: 12px;
      overflow: auto;
      max-height: 320px;
    }
  </style>
</head>
<body>
  <header>
    <h1>Queues</h1>
    <div class="muted">Read-only. Refreshes every 5s. JSON under api/queues, Prometheus under metrics.</div>
  </header>
  <main id="queues"></main>
  <script>
    const base = location.pathname.replace(/\/$/, "");
    const states = ["waiting", "active", "delayed", "paused", "completed", "failed"];

    function card(q) {
      const rows = states
        .map(s => `<tr><td>${s}</td><td class="n">${q.counts[s]}</td></tr>`)
        .join("");
      const options = states.map(s => `<option>${s}</option>`).join("");
      return `<section class="${q.dead_letter ? "dlq" : ""}">
        <h2>${q.name}</h2>
        <div class="muted">${q.dead_letter ? "dead-letter queue" : "queue"}${q.paused ? " (paused)" : ""}</div>
        <table>${rows}</table>
        <select id="state-${q.name}">${options}</select>
        <button onclick="loadJobs('${q.name}')">Jobs</button>
        <pre id="jobs-${q.name}" hidden></pre>
      </section>`;
    }

    async function refresh() {
      const res = await fetch(base + "/api/queues");
      const el = document.getElementById("queues");
      if (!res.ok) {
        el.textContent = await res.text();
        return;
      }
      const queues = await res.json();
      el.innerHTML = queues.map(card).join("");
    }

    async function loadJobs(name) {
      const state = document.getElementById("state-" + name).value;
      const res = await fetch(base + "/api/queues/" + encodeURIComponent(name) + "/jobs?limit=20&state=" + state);
      const out = document.getElementById("jobs-" + name);
      out.hidden = false;
      out.textContent = res.ok ? JSON.stringify(await res.json(), null, 2) : await res.text();
    }

    refresh();
    setInterval(refresh, 5000);
  </script>
</body>
</html>
"#;
