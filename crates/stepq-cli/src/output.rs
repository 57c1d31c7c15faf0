use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, Table};
use stepq_broker::LabelDepth;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
}

pub fn render_depths(depths: &[LabelDepth], format: OutputFormat) -> anyhow::Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(depths)?),
        OutputFormat::Yaml => Ok(serde_yaml::to_string(depths)?),
        OutputFormat::Table => {
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["Label", "Weight", "Visible", "In flight", "Delayed", "URL"]);
            for entry in depths {
                table.add_row(vec![
                    entry.label.clone(),
                    entry.weight.to_string(),
                    entry.depth.visible.to_string(),
                    entry.depth.in_flight.to_string(),
                    entry.depth.delayed.to_string(),
                    entry.url.clone(),
                ]);
            }
            Ok(table.to_string())
        }
    }
}
