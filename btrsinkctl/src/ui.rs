use chrono::SecondsFormat;
use comfy_table::presets::UTF8_FULL;
use comfy_table::*;
use libbtrsink::core::humanize;
use libbtrsink::model::Volume;

pub fn print_comfy_table(header: Vec<Cell>, rows: impl Iterator<Item = Vec<Cell>>) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);

    rows.for_each(|r| {
        table.add_row(r);
    });

    println!("{}", table);
}

pub fn print_volume_list(volumes: &[Volume]) {
    print_comfy_table(
        vec![
            Cell::new("Path").add_attribute(Attribute::Bold),
            Cell::new("UUID").add_attribute(Attribute::Bold),
            Cell::new("Parent"),
            Cell::new("Created"),
            Cell::new("Size"),
        ],
        volumes.iter().map(|v| {
            vec![
                Cell::new(v.paths.join(" ")).fg(Color::Blue),
                Cell::new(v.uuid),
                Cell::new(v.parent_uuid.map(|u| u.to_string()).unwrap_or_else(|| String::from("-"))),
                Cell::new(v.otime.to_rfc3339_opts(SecondsFormat::Secs, true)),
                Cell::new(humanize(v.size)),
            ]
        }),
    );
}
