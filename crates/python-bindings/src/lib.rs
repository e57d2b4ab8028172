use pyo3::create_exception;
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use serde::Serialize;
use tokio::runtime::Runtime;

use local_inference::HardwareTier;

create_exception!(local_inference_py, LifecycleError, PyRuntimeError);

fn to_py_err(e: local_inference::LifecycleError) -> PyErr {
    LifecycleError::new_err((e.kind(), e.to_string(), e.is_retryable()))
}

/// Results cross the boundary as JSON text; `json.loads` them on the Python side.
fn to_json<T: Serialize>(value: &T) -> PyResult<String> {
    serde_json::to_string(value).map_err(|e| PyRuntimeError::new_err(e.to_string()))
}

#[pyclass]
pub struct Config {
    inner: local_inference::Config,
}

#[pymethods]
impl Config {
    #[staticmethod]
    fn from_env() -> PyResult<Config> {
        match local_inference::Config::from_env() {
            Ok(config) => Ok(Config { inner: config }),
            Err(e) => Err(PyErr::new::<PyRuntimeError, _>(format!(
                "Failed to load config: {}",
                e
            ))),
        }
    }

    #[getter]
    fn cache_dir(&self) -> String {
        self.inner.cache_dir.display().to_string()
    }

    #[getter]
    fn catalog_url(&self) -> Option<String> {
        self.inner.catalog_url.clone()
    }

    #[getter]
    fn hardware(&self) -> Option<String> {
        self.inner.hardware.map(|t| t.to_string())
    }
}

#[pyclass]
pub struct LifecycleManager {
    rt: Runtime,
    inner: local_inference::LifecycleManager,
}

#[pymethods]
impl LifecycleManager {
    #[new]
    #[pyo3(signature = (config=None))]
    fn new(config: Option<&Config>) -> PyResult<Self> {
        let rt = Runtime::new().map_err(|e| {
            PyErr::new::<PyRuntimeError, _>(format!("Failed to create async runtime: {}", e))
        })?;
        let config = match config {
            Some(c) => c.inner.clone(),
            None => local_inference::Config::from_env()
                .map_err(|e| PyRuntimeError::new_err(format!("Failed to load config: {}", e)))?,
        };
        let inner = rt
            .block_on(local_inference::LifecycleManager::new(config))
            .map_err(to_py_err)?;
        Ok(Self { rt, inner })
    }

    #[pyo3(signature = (alias, hardware=None))]
    fn init(&self, py: Python<'_>, alias: &str, hardware: Option<&str>) -> PyResult<String> {
        let hardware = hardware
            .map(str::parse::<HardwareTier>)
            .transpose()
            .map_err(PyValueError::new_err)?;
        let handle = py
            .allow_threads(|| self.rt.block_on(self.inner.init(alias, hardware)))
            .map_err(to_py_err)?;
        to_json(&handle)
    }

    fn download(&self, py: Python<'_>, alias: &str) -> PyResult<String> {
        let entry = py
            .allow_threads(|| self.rt.block_on(self.inner.download(alias)))
            .map_err(to_py_err)?;
        to_json(&entry)
    }

    fn load(&self, py: Python<'_>, variant_id: &str) -> PyResult<String> {
        let handle = py
            .allow_threads(|| self.rt.block_on(self.inner.load(variant_id)))
            .map_err(to_py_err)?;
        to_json(&handle)
    }

    fn unload(&self, py: Python<'_>, variant_id: &str) -> PyResult<()> {
        py.allow_threads(|| self.rt.block_on(self.inner.unload(variant_id)))
            .map_err(to_py_err)
    }

    fn list_loaded(&self) -> PyResult<String> {
        to_json(&self.inner.list_loaded())
    }

    fn shutdown(&self, py: Python<'_>) -> PyResult<()> {
        py.allow_threads(|| self.rt.block_on(self.inner.shutdown()))
            .map_err(to_py_err)
    }

    /// Endpoint JSON, or None while no service is associated.
    fn endpoint(&self) -> PyResult<Option<String>> {
        self.inner.endpoint().map(|e| to_json(&e)).transpose()
    }

    fn api_key(&self) -> Option<String> {
        self.inner.api_key()
    }

    fn __repr__(&self) -> String {
        format!(
            "LifecycleManager(hardware='{}', loaded={})",
            self.inner.hardware().tier,
            self.inner.list_loaded().len()
        )
    }
}

#[pymodule]
fn local_inference_py(py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<Config>()?;
    m.add_class::<LifecycleManager>()?;
    m.add("LifecycleError", py.get_type::<LifecycleError>())?;

    m.add("__version__", env!("CARGO_PKG_VERSION"))?;

    Ok(())
}
