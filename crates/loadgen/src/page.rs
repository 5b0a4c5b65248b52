//! The static control page served at `/`.

pub const CONTROL_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Load Generator Control Panel</title>
    <style>
        body { font-family: Arial, sans-serif; margin: 20px; background: #f5f5f5; }
        .container { max-width: 1200px; margin: 0 auto; }
        .card { background: white; padding: 20px; margin: 20px 0; border-radius: 8px; box-shadow: 0 2px 4px rgba(0,0,0,0.1); }
        .form-group { margin: 15px 0; }
        label { display: block; margin-bottom: 5px; font-weight: bold; }
        input { padding: 8px; border: 1px solid #ddd; border-radius: 4px; width: 200px; }
        button { padding: 10px 20px; margin: 5px; border: none; border-radius: 4px; cursor: pointer; }
        .btn-primary { background: #007acc; color: white; }
        .btn-danger { background: #dc3545; color: white; }
        .btn-primary:hover { background: #005a9e; }
        .btn-danger:hover { background: #c82333; }
        .status { padding: 10px; border-radius: 4px; margin: 10px 0; }
        .status.running { background: #d4edda; color: #155724; }
        .status.stopped { background: #f8d7da; color: #721c24; }
        .metrics { display: grid; grid-template-columns: repeat(auto-fit, minmax(200px, 1fr)); gap: 15px; }
        .metric { background: #e9ecef; padding: 15px; border-radius: 4px; text-align: center; }
        .metric-value { font-size: 24px; font-weight: bold; color: #007acc; }
        .report { border: 1px solid #ddd; margin: 10px 0; padding: 15px; border-radius: 4px; }
        .report h4 { margin: 0 0 10px 0; color: #333; }
        .note { font-size: 14px; color: #666; margin-top: 10px; }
    </style>
</head>
<body>
    <div class="container">
        <h1>Load Generator Control Panel</h1>

        <div class="card">
            <h2>Start Load Test</h2>
            <div class="form-group">
                <label>Users:</label>
                <input type="number" id="users" value="10" min="1" max="1000">
            </div>
            <div class="form-group">
                <label>Duration:</label>
                <input type="text" id="duration" value="2m" placeholder="e.g., 30s, 5m, 1h">
            </div>
            <div class="form-group">
                <label>Ramp-up Rate:</label>
                <input type="text" id="ramp" value="5/s" placeholder="e.g., 5/s, 10/s">
            </div>
            <button class="btn-primary" onclick="startTest()">Start Test</button>
            <button class="btn-danger" onclick="stopTest()">Stop Test</button>
        </div>

        <div class="card">
            <h2>Current Status</h2>
            <div id="status" class="status stopped">No test running</div>
            <div id="metrics" class="metrics"></div>
        </div>

        <div class="card">
            <h2>Reduce Load</h2>
            <p>Remove load-generated users and their data (only affects users created by the load generator).</p>
            <div class="form-group">
                <label>Users to Delete:</label>
                <input type="number" id="reduceCount" value="10" min="1" max="1000">
            </div>
            <button class="btn-danger" onclick="reduceLoad()">Reduce Load</button>
            <div id="loadInfo" class="note"></div>
            <div class="note">Tracked users: <span id="trackedCount">0</span></div>
            <div id="trackedList" class="note"></div>
        </div>

        <div class="card">
            <h2>Delete Users (direct)</h2>
            <p>Directly delete N test users from the user service (usernames starting with <code>user_</code>).</p>
            <div class="form-group">
                <label>Users to Delete:</label>
                <input type="number" id="deleteCount" value="10" min="1" max="1000">
            </div>
            <button class="btn-danger" onclick="deleteUsersDirect()">Delete Users</button>
            <div id="deleteInfo" class="note"></div>
        </div>

        <div class="card">
            <h2>Test Reports</h2>
            <div id="reports"></div>
        </div>
    </div>

    <script>
        function startTest() {
            const users = parseInt(document.getElementById('users').value);
            const duration = document.getElementById('duration').value;
            const ramp = document.getElementById('ramp').value;
            fetch('/api/start', {
                method: 'POST',
                headers: {'Content-Type': 'application/json'},
                body: JSON.stringify({users, duration, ramp})
            }).then(r => r.json()).then(() => updateStatus());
        }

        function stopTest() {
            fetch('/api/stop', {method: 'POST'})
                .then(r => r.json())
                .then(() => updateStatus());
        }

        function updateStatus() {
            fetch('/api/status')
                .then(r => r.json())
                .then(data => {
                    const statusDiv = document.getElementById('status');
                    if (data.status === 'running') {
                        statusDiv.className = 'status running';
                        statusDiv.innerHTML = 'Running: ' + data.users + ' users, ' + data.duration + ' duration, ' + data.ramp + ' ramp-up';
                    } else {
                        statusDiv.className = 'status stopped';
                        statusDiv.innerHTML = 'No test running';
                    }
                    updateMetrics();
                });
        }

        function updateMetrics() {
            fetch('/api/overview')
                .then(r => r.json())
                .then(data => {
                    const totalUsers = data.total_users || 0;
                    const m = data.metrics || {};
                    const tracked = data.tracked_users || [];
                    document.getElementById('trackedCount').innerText = data.tracked_count || 0;
                    const listDiv = document.getElementById('trackedList');
                    if (tracked.length === 0) {
                        listDiv.innerHTML = '<em>No tracked test users</em>';
                    } else {
                        listDiv.innerHTML = tracked.map(u =>
                            '<div>' + u + ' <button onclick="deleteSingleUser(\'' + u + '\')">Delete</button></div>'
                        ).join('');
                    }
                    document.getElementById('metrics').innerHTML =
                        '<div class="metric"><div class="metric-value">' + totalUsers + '</div><div>Total Users</div></div>' +
                        '<div class="metric"><div class="metric-value">' + (m.active_users || 0) + '</div><div>Active Users</div></div>' +
                        '<div class="metric"><div class="metric-value">' + (m.websocket_connections || 0) + '</div><div>WebSocket Connections</div></div>' +
                        '<div class="metric"><div class="metric-value">' + (m.total_requests || 0) + '</div><div>Total Requests</div></div>';
                })
                .catch(() => {
                    document.getElementById('metrics').innerHTML =
                        '<div class="metric"><div class="metric-value">-</div><div>Metrics Unavailable</div></div>';
                });
        }

        function deleteSingleUser(username) {
            if (!confirm('Delete user ' + username + '? This removes the account and related posts/messages.')) return;
            fetch('/api/delete-user', {
                method: 'POST',
                headers: {'Content-Type': 'application/json'},
                body: JSON.stringify({username})
            }).then(r => r.json()).then(data => {
                if (data.deleted) {
                    document.getElementById('loadInfo').innerHTML = 'Deleted ' + username + '. ' + (data.remaining || 0) + ' users remain.';
                    updateMetrics();
                } else {
                    document.getElementById('loadInfo').innerHTML = 'Failed to delete ' + username + ' (status ' + (data.status_code || 'unknown') + ')';
                }
            });
        }

        function renderFailures(failed) {
            const entries = Object.keys(failed || {}).map(k => k + ' (status ' + failed[k] + ')');
            return entries.length ? '<div>Failed to delete: ' + entries.join(', ') + '</div>' : '';
        }

        function reduceLoad() {
            const count = parseInt(document.getElementById('reduceCount').value);
            if (count > 50 && !confirm('Delete ' + count + ' test users? This cannot be undone.')) return;
            fetch('/api/reduce', {
                method: 'POST',
                headers: {'Content-Type': 'application/json'},
                body: JSON.stringify({count})
            }).then(r => r.json()).then(data => {
                const deleted = data.deleted_users || [];
                let html = 'Reduced load: ' + deleted.length + ' users removed. ' + (data.remaining || 0) + ' users remain.';
                if (deleted.length) html += '<div>Deleted: ' + deleted.join(', ') + '</div>';
                html += renderFailures(data.failed_users);
                document.getElementById('loadInfo').innerHTML = html;
                document.getElementById('trackedCount').innerText = data.remaining || 0;
                updateMetrics();
            });
        }

        function deleteUsersDirect() {
            const count = parseInt(document.getElementById('deleteCount').value);
            if (count > 50 && !confirm('Delete ' + count + ' test users directly from the user service? This cannot be undone.')) return;
            fetch('/api/delete-users', {
                method: 'POST',
                headers: {'Content-Type': 'application/json'},
                body: JSON.stringify({count})
            }).then(r => r.json()).then(data => {
                const deleted = data.deleted_users || [];
                let html = 'Deleted ' + deleted.length + ' users. ' + (data.remaining || 0) + ' users remain.';
                if (deleted.length) html += '<div>Deleted: ' + deleted.join(', ') + '</div>';
                html += renderFailures(data.failed_users);
                document.getElementById('deleteInfo').innerHTML = html;
                updateMetrics();
            });
        }

        function updateReports() {
            fetch('/api/reports')
                .then(r => r.json())
                .then(data => {
                    const reportsDiv = document.getElementById('reports');
                    if (data.length === 0) {
                        reportsDiv.innerHTML = '<p>No test reports yet</p>';
                        return;
                    }
                    reportsDiv.innerHTML = data.map(report => {
                        const durationMs = new Date(report.end_time) - new Date(report.start_time);
                        return '<div class="report">' +
                            '<h4>Test #' + report.id + ' - ' + report.status.toUpperCase() + '</h4>' +
                            '<p><strong>Config:</strong> ' + report.users + ' users, ' + report.duration + ' duration, ' + report.ramp + ' ramp-up</p>' +
                            '<p><strong>Started:</strong> ' + new Date(report.start_time).toLocaleString() + '</p>' +
                            '<p><strong>Ended:</strong> ' + new Date(report.end_time).toLocaleString() + '</p>' +
                            '<p><strong>Actual Duration:</strong> ' + Math.round(durationMs / 1000) + 's</p>' +
                            '</div>';
                    }).reverse().join('');
                });
        }

        setInterval(() => {
            updateStatus();
            updateReports();
        }, 2000);
        updateStatus();
        updateReports();
    </script>
</body>
</html>
"#;
