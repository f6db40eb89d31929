//! Prometheus text exposition format.
//!
//! Renders exporter snapshots into the text format scraped by a
//! Prometheus server or compatible agent.

use crate::exporters::{ApiSnapshot, RunnerSnapshot};

/// Render runner and API snapshots into Prometheus text format.
pub fn render_prometheus(runners: &[RunnerSnapshot], api: &ApiSnapshot) -> String {
    let mut out = String::new();

    out.push_str(
        "# HELP playground_pipeline_step_total Pipeline step executions by step and status.\n",
    );
    out.push_str("# TYPE playground_pipeline_step_total counter\n");
    for r in runners {
        for (step, snap) in &r.pipeline {
            out.push_str(&format!(
                "playground_pipeline_step_total{{runner=\"{}\",type=\"{}\",step=\"{}\",status=\"success\"}} {}\n",
                r.runner_name, r.runner_type, step, snap.success
            ));
            out.push_str(&format!(
                "playground_pipeline_step_total{{runner=\"{}\",type=\"{}\",step=\"{}\",status=\"failure\"}} {}\n",
                r.runner_name, r.runner_type, step, snap.failure
            ));
        }
    }

    out.push_str(
        "# HELP playground_pipeline_step_duration_seconds_total Accumulated step duration.\n",
    );
    out.push_str("# TYPE playground_pipeline_step_duration_seconds_total counter\n");
    for r in runners {
        for (step, snap) in &r.pipeline {
            out.push_str(&format!(
                "playground_pipeline_step_duration_seconds_total{{runner=\"{}\",step=\"{}\"}} {:.6}\n",
                r.runner_name,
                step,
                snap.duration_us as f64 / 1e6
            ));
        }
    }

    out.push_str("# HELP playground_gc_collected_total Objects removed by GC.\n");
    out.push_str("# TYPE playground_gc_collected_total counter\n");
    for r in runners {
        out.push_str(&format!(
            "playground_gc_collected_total{{runner=\"{}\",class=\"container\"}} {}\n",
            r.runner_name, r.containers_collected
        ));
        out.push_str(&format!(
            "playground_gc_collected_total{{runner=\"{}\",class=\"image\"}} {}\n",
            r.runner_name, r.images_collected
        ));
    }

    out.push_str("# HELP playground_gc_space_reclaimed_bytes_total Bytes reclaimed by GC.\n");
    out.push_str("# TYPE playground_gc_space_reclaimed_bytes_total counter\n");
    for r in runners {
        out.push_str(&format!(
            "playground_gc_space_reclaimed_bytes_total{{runner=\"{}\",class=\"container\"}} {}\n",
            r.runner_name, r.containers_space_reclaimed_bytes
        ));
        out.push_str(&format!(
            "playground_gc_space_reclaimed_bytes_total{{runner=\"{}\",class=\"image\"}} {}\n",
            r.runner_name, r.images_space_reclaimed_bytes
        ));
    }

    out.push_str("# HELP playground_paused_containers Paused containers seen by GC.\n");
    out.push_str("# TYPE playground_paused_containers gauge\n");
    for r in runners {
        out.push_str(&format!(
            "playground_paused_containers{{runner=\"{}\"}} {}\n",
            r.runner_name, r.paused_containers
        ));
    }

    out.push_str("# HELP playground_owned_objects Current count of owned daemon objects.\n");
    out.push_str("# TYPE playground_owned_objects gauge\n");
    for r in runners {
        out.push_str(&format!(
            "playground_owned_objects{{runner=\"{}\",class=\"image\"}} {}\n",
            r.runner_name, r.image_count
        ));
        out.push_str(&format!(
            "playground_owned_objects{{runner=\"{}\",class=\"container\"}} {}\n",
            r.runner_name, r.container_count
        ));
    }

    out.push_str("# HELP playground_owned_bytes Current size of owned daemon objects.\n");
    out.push_str("# TYPE playground_owned_bytes gauge\n");
    for r in runners {
        out.push_str(&format!(
            "playground_owned_bytes{{runner=\"{}\",class=\"image\"}} {}\n",
            r.runner_name, r.image_bytes
        ));
        out.push_str(&format!(
            "playground_owned_bytes{{runner=\"{}\",class=\"container\"}} {}\n",
            r.runner_name, r.container_bytes
        ));
    }

    out.push_str("# HELP playground_prewarmer_fetches_total Prewarm pool fetches by outcome.\n");
    out.push_str("# TYPE playground_prewarmer_fetches_total counter\n");
    for r in runners {
        out.push_str(&format!(
            "playground_prewarmer_fetches_total{{runner=\"{}\",status=\"hit\"}} {}\n",
            r.runner_name, r.fetch_hits
        ));
        out.push_str(&format!(
            "playground_prewarmer_fetches_total{{runner=\"{}\",status=\"miss\"}} {}\n",
            r.runner_name, r.fetch_misses
        ));
    }

    out.push_str("# HELP playground_prewarmer_set_updates_total Prewarm pool membership changes.\n");
    out.push_str("# TYPE playground_prewarmer_set_updates_total counter\n");
    for r in runners {
        for (action, count) in [
            ("add", r.containers_added),
            ("fetch", r.containers_fetched),
            ("eject", r.containers_ejected),
        ] {
            out.push_str(&format!(
                "playground_prewarmer_set_updates_total{{runner=\"{}\",action=\"{}\"}} {}\n",
                r.runner_name, action, count
            ));
        }
    }

    out.push_str("# HELP playground_api_requests_total HTTP requests served.\n");
    out.push_str("# TYPE playground_api_requests_total counter\n");
    out.push_str(&format!("playground_api_requests_total {}\n", api.requests_total));

    out.push_str("# HELP playground_api_errors_total HTTP requests answered with an error status.\n");
    out.push_str("# TYPE playground_api_errors_total counter\n");
    out.push_str(&format!("playground_api_errors_total {}\n", api.errors_total));

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporters::MetricsHub;

    fn hub_with_one_runner() -> MetricsHub {
        let hub = MetricsHub::new();
        let m = hub.runner("DOCKER_ENGINE", "docker-1");
        m.prewarmer.fetch_hits.inc();
        m.gc.containers_collected.add(3);
        m.status.image_count.set(7);
        hub
    }

    #[test]
    fn render_empty() {
        let out = render_prometheus(&[], &ApiSnapshot::default());
        // Type declarations are always present.
        assert!(out.contains("# HELP playground_pipeline_step_total"));
        assert!(out.contains("# TYPE playground_api_requests_total counter"));
        assert!(out.contains("playground_api_requests_total 0"));
    }

    #[test]
    fn render_single_runner() {
        let hub = hub_with_one_runner();
        let out = render_prometheus(&hub.runner_snapshots(), &hub.api_snapshot());

        assert!(out.contains(
            "playground_prewarmer_fetches_total{runner=\"docker-1\",status=\"hit\"} 1"
        ));
        assert!(out.contains(
            "playground_gc_collected_total{runner=\"docker-1\",class=\"container\"} 3"
        ));
        assert!(out.contains("playground_owned_objects{runner=\"docker-1\",class=\"image\"} 7"));
    }

    #[test]
    fn render_format_is_prometheus_compatible() {
        let hub = hub_with_one_runner();
        let out = render_prometheus(&hub.runner_snapshots(), &hub.api_snapshot());

        // Every non-comment line is `name{labels} value` or `name value`.
        for line in out.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (name_part, value) = line.rsplit_once(' ').expect("line should have a value");
            assert!(!name_part.is_empty());
            assert!(value.parse::<f64>().is_ok(), "value not numeric: {line}");
        }
    }
}
