//! Collaborators the pipeline consumes through narrow interfaces.

pub mod alert;
pub mod explain;
pub mod registry;
pub mod weather;

pub use alert::{Alert, AlertError, AlertSink, LogAlertSink, WebhookAlertSink};
pub use explain::{
    template_explanation, ExplainError, Explainer, Language, OpenAiExplainer, TemplateExplainer,
};
pub use registry::{FileRegistry, RegistryError, SensorMetadata, SensorRegistry, StaticRegistry};
pub use weather::{
    FixedWeather, OpenWeatherProvider, WeatherConditions, WeatherError, WeatherProvider,
};
