use k8s_openapi::api::core::v1::{ExecAction, HTTPGetAction, Probe};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::api::v1::FunctionSpec;
use crate::util::errors::{Error, Result, StdError};
use crate::workload::{
    FunctionFactory, ProbeConfig, PROBE_INITIAL_DELAY_ANNOTATION, PROBE_PATH_ANNOTATION, WATCHDOG_PORT,
};

const DEFAULT_HEALTH_PATH: &str = "/_/health";
const LOCK_FILE: &str = "/tmp/.lock";

#[derive(Clone, Debug, PartialEq)]
pub struct FunctionProbes {
    pub liveness: Probe,
    pub readiness: Probe,
}

impl FunctionFactory {
    /// Liveness and readiness probes for a Function.
    ///
    /// The HTTP path and initial delay can be overridden per Function through
    /// annotations; an unparseable delay is an error rather than a silent default.
    pub fn make_probes(&self, spec: &FunctionSpec) -> Result<FunctionProbes> {
        let path = spec
            .annotation(PROBE_PATH_ANNOTATION)
            .unwrap_or(DEFAULT_HEALTH_PATH);

        let mut liveness = self.probe(path, &self.config.liveness_probe);
        let mut readiness = self.probe(path, &self.config.readiness_probe);

        if let Some(raw) = spec.annotation(PROBE_INITIAL_DELAY_ANNOTATION) {
            let delay = humantime::parse_duration(raw.trim()).map_err(|e| {
                Error::StdError(StdError::InvalidDuration {
                    annotation: PROBE_INITIAL_DELAY_ANNOTATION.to_string(),
                    value: raw.to_string(),
                    reason: e.to_string(),
                })
            })?;
            let seconds = i32::try_from(delay.as_secs()).unwrap_or(i32::MAX);
            liveness.initial_delay_seconds = Some(seconds);
            readiness.initial_delay_seconds = Some(seconds);
        }

        Ok(FunctionProbes { liveness, readiness })
    }

    fn probe(&self, path: &str, timings: &ProbeConfig) -> Probe {
        let (http_get, exec) = if self.config.http_probe {
            let action = HTTPGetAction {
                path: Some(path.to_string()),
                port: IntOrString::Int(WATCHDOG_PORT),
                scheme: Some("HTTP".to_string()),
                ..Default::default()
            };
            (Some(action), None)
        } else {
            let action = ExecAction {
                command: Some(vec!["cat".to_string(), LOCK_FILE.to_string()]),
            };
            (None, Some(action))
        };

        Probe {
            http_get,
            exec,
            initial_delay_seconds: Some(timings.initial_delay_seconds),
            timeout_seconds: Some(timings.timeout_seconds),
            period_seconds: Some(timings.period_seconds),
            success_threshold: Some(1),
            failure_threshold: Some(3),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::FactoryConfig;
    use std::collections::BTreeMap;

    fn annotated(pairs: &[(&str, &str)]) -> FunctionSpec {
        FunctionSpec {
            name: "echo".into(),
            annotations: Some(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn http_probe_uses_default_path_and_config_timings() {
        let probes = FunctionFactory::default().make_probes(&FunctionSpec::default()).unwrap();
        let http = probes.liveness.http_get.unwrap();
        assert_eq!(http.path.as_deref(), Some("/_/health"));
        assert_eq!(http.port, IntOrString::Int(8080));
        assert_eq!(probes.readiness.period_seconds, Some(2));
        assert_eq!(probes.readiness.initial_delay_seconds, Some(2));
    }

    #[test]
    fn annotations_override_path_and_delay() {
        let spec = annotated(&[
            (PROBE_PATH_ANNOTATION, "/ready"),
            (PROBE_INITIAL_DELAY_ANNOTATION, "30s"),
        ]);
        let probes = FunctionFactory::default().make_probes(&spec).unwrap();
        assert_eq!(
            probes.readiness.http_get.unwrap().path.as_deref(),
            Some("/ready")
        );
        assert_eq!(probes.liveness.initial_delay_seconds, Some(30));
        assert_eq!(probes.readiness.initial_delay_seconds, Some(30));
    }

    #[test]
    fn malformed_delay_is_an_error() {
        let spec = annotated(&[(PROBE_INITIAL_DELAY_ANNOTATION, "soon")]);
        let err = FunctionFactory::default().make_probes(&spec).unwrap_err();
        assert_eq!(err.metric_label(), "invalidduration");
    }

    #[test]
    fn exec_probe_when_http_disabled() {
        let factory = FunctionFactory::new(FactoryConfig {
            http_probe: false,
            ..Default::default()
        });
        let probes = factory.make_probes(&FunctionSpec::default()).unwrap();
        assert!(probes.liveness.http_get.is_none());
        assert_eq!(
            probes.liveness.exec.unwrap().command,
            Some(vec!["cat".to_string(), "/tmp/.lock".to_string()])
        );
    }
}
