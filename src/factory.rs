//! Instrument discovery: try every known driver of a kind until one connects.

use anyhow::{anyhow, Result};
use futures::future::{BoxFuture, FutureExt};
use tracing::{error, info};

use crate::camera::Camera;
use crate::config::Settings;
use crate::error::is_instrument_error;
use crate::generator::{Keysight33500b, RigolDg1022z, WaveformGenerator};
use crate::manipulator::{Manipulator, SutterMp285a};
use crate::resource::ResourceManager;
use crate::scope::{Bk2555, Oscilloscope, RigolDs1054z};

/// Builds one candidate instrument.
pub type Constructor<'a, T> = Box<dyn Fn() -> BoxFuture<'a, Result<T>> + Send + Sync + 'a>;

/// Named constructors, tried in order.
pub type Registry<'a, T> = Vec<(&'static str, Constructor<'a, T>)>;

fn constructor<'a, T, F>(build: F) -> Constructor<'a, T>
where
    F: Fn() -> BoxFuture<'a, Result<T>> + Send + Sync + 'a,
{
    Box::new(build)
}

/// Connect to the instrument registered under `key`, or to the first
/// candidate that connects when `key` is `None`.
///
/// Without a key, candidates failing with an instrument error (not
/// detected, timeout, I/O) are skipped; any other error is returned.
pub async fn grab_instrument<T>(kind: &str, candidates: &Registry<'_, T>, key: Option<&str>) -> Result<T> {
    if let Some(key) = key {
        let Some((_, build)) = candidates.iter().find(|(name, _)| *name == key) else {
            let names: Vec<&str> = candidates.iter().map(|(name, _)| *name).collect();
            return Err(anyhow!(
                "Invalid {kind} key: \"{key}\". Candidates are: {}",
                names.join(", ")
            ));
        };
        return build().await;
    }
    for (name, build) in candidates {
        info!("Attempting to grab \"{name}\" {kind} ...");
        match build().await {
            Ok(inst) => return Ok(inst),
            Err(e) if is_instrument_error(&e) => {
                error!("Failed to grab \"{name}\" {kind}: {e:#}");
            }
            Err(e) => return Err(e),
        }
    }
    Err(anyhow!("No {kind} found"))
}

async fn rigol_generator(rm: &ResourceManager) -> Result<Box<dyn WaveformGenerator>> {
    Ok(Box::new(RigolDg1022z::connect(rm).await?))
}

async fn keysight_generator(rm: &ResourceManager) -> Result<Box<dyn WaveformGenerator>> {
    Ok(Box::new(Keysight33500b::connect(rm).await?))
}

async fn bk_oscilloscope(rm: &ResourceManager) -> Result<Box<dyn Oscilloscope>> {
    Ok(Box::new(Bk2555::connect(rm).await?))
}

async fn rigol_oscilloscope(rm: &ResourceManager) -> Result<Box<dyn Oscilloscope>> {
    Ok(Box::new(RigolDs1054z::connect(rm).await?))
}

async fn sutter_manipulator(settings: &Settings) -> Result<Box<dyn Manipulator>> {
    Ok(Box::new(SutterMp285a::connect(&settings.sutter).await?))
}

async fn flir_camera() -> Result<Camera> {
    tokio::task::spawn_blocking(Camera::grab).await?
}

pub fn generators(rm: &ResourceManager) -> Registry<'_, Box<dyn WaveformGenerator>> {
    vec![
        ("rigol", constructor(move || rigol_generator(rm).boxed())),
        ("keysight", constructor(move || keysight_generator(rm).boxed())),
    ]
}

pub fn oscilloscopes(rm: &ResourceManager) -> Registry<'_, Box<dyn Oscilloscope>> {
    vec![
        ("bk", constructor(move || bk_oscilloscope(rm).boxed())),
        ("rigol", constructor(move || rigol_oscilloscope(rm).boxed())),
    ]
}

pub fn manipulators(settings: &Settings) -> Registry<'_, Box<dyn Manipulator>> {
    vec![("sutter", constructor(move || sutter_manipulator(settings).boxed()))]
}

pub fn cameras() -> Registry<'static, Camera> {
    vec![("flir", constructor(|| flir_camera().boxed()))]
}

pub async fn grab_generator(settings: &Settings, key: Option<&str>) -> Result<Box<dyn WaveformGenerator>> {
    let rm = ResourceManager::from_settings(&settings.visa)?;
    grab_instrument("generator", &generators(&rm), key).await
}

pub async fn grab_oscilloscope(settings: &Settings, key: Option<&str>) -> Result<Box<dyn Oscilloscope>> {
    let rm = ResourceManager::from_settings(&settings.visa)?;
    grab_instrument("oscilloscope", &oscilloscopes(&rm), key).await
}

pub async fn grab_manipulator(settings: &Settings, key: Option<&str>) -> Result<Box<dyn Manipulator>> {
    grab_instrument("manipulator", &manipulators(settings), key).await
}

pub async fn grab_camera(key: Option<&str>) -> Result<Camera> {
    grab_instrument("camera", &cameras(), key).await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::error::{CameraError, SutterError, VisaError};

    fn candidate<T: Send + 'static>(
        result: impl Fn() -> Result<T> + Send + Sync + 'static,
    ) -> Constructor<'static, T> {
        Box::new(move || {
            let result = result();
            async move { result }.boxed()
        })
    }

    fn registry(attempts: Arc<AtomicUsize>) -> Registry<'static, &'static str> {
        let missing = attempts.clone();
        let unplugged = attempts;
        vec![
            (
                "missing",
                candidate(move || {
                    missing.fetch_add(1, Ordering::SeqCst);
                    Err::<&str, _>(VisaError::NotDetected("ABC".into()).into())
                }),
            ),
            (
                "unplugged",
                candidate(move || {
                    unplugged.fetch_add(1, Ordering::SeqCst);
                    Err::<&str, _>(SutterError::PortNotFound(r"^SI\w+$".into()).into())
                }),
            ),
            ("ok", candidate(|| Ok("found"))),
        ]
    }

    #[tokio::test]
    async fn first_working_candidate_wins() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let inst = grab_instrument("generator", &registry(attempts.clone()), None)
            .await
            .unwrap();
        assert_eq!(inst, "found");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn key_selects_a_single_candidate() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let err = grab_instrument("generator", &registry(attempts.clone()), Some("missing"))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<VisaError>().is_some());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_key_lists_candidates() {
        let err = grab_instrument("oscilloscope", &registry(Arc::default()), Some("tek"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid oscilloscope key: \"tek\". Candidates are: missing, unplugged, ok"
        );
    }

    #[tokio::test]
    async fn nothing_detected() {
        let mut candidates = registry(Arc::default());
        candidates.pop();
        let err = grab_instrument("camera", &candidates, None).await.unwrap_err();
        assert_eq!(err.to_string(), "No camera found");
    }

    #[tokio::test]
    async fn other_errors_stop_the_search() {
        let candidates: Registry<'static, u8> = vec![
            ("bad", candidate(|| Err(anyhow!("invalid settings")))),
            ("ok", candidate(|| Ok(1))),
        ];
        let err = grab_instrument("generator", &candidates, None).await.unwrap_err();
        assert_eq!(err.to_string(), "invalid settings");
    }

    #[tokio::test]
    async fn empty_visa_settings_find_no_generator() {
        let err = grab_generator(&Settings::default(), None).await.err().unwrap();
        assert_eq!(err.to_string(), "No generator found");
    }

    #[cfg(not(feature = "flycapture"))]
    #[tokio::test]
    async fn camera_grab_runs_on_the_blocking_pool() {
        let err = grab_camera(Some("flir")).await.err().unwrap();
        assert!(matches!(
            err.downcast_ref::<CameraError>(),
            Some(CameraError::BackendUnavailable)
        ));
        let err = grab_camera(None).await.err().unwrap();
        assert_eq!(err.to_string(), "No camera found");
    }

    #[test]
    fn registries_are_ordered() {
        let rm = ResourceManager::new(Vec::new(), std::time::Duration::from_secs(1));
        let names: Vec<&str> = oscilloscopes(&rm).iter().map(|(n, _)| *n).collect();
        assert_eq!(names, ["bk", "rigol"]);
        let names: Vec<&str> = generators(&rm).iter().map(|(n, _)| *n).collect();
        assert_eq!(names, ["rigol", "keysight"]);
        assert_eq!(cameras()[0].0, "flir");
    }
}
