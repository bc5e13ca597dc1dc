use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Install report '{}' is not of the form '<state>@<generation>'", report))]
    MissingGeneration { report: String },

    #[snafu(display("Install report '{}' has an unknown state: '{}'", report, source))]
    ReportState {
        report: String,
        source: serde_plain::Error,
    },

    #[snafu(display("Install report '{}' has an invalid generation: '{}'", report, source))]
    ReportGeneration {
        report: String,
        source: std::num::ParseIntError,
    },
}
