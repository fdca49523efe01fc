//! Static HTML summaries of the aggregated counts, one directory per guild.

use crate::db::{ChannelRecord, GuildRecord};
use crate::report::{
    busiest_day, busiest_month, monthly_rollup, DatedCount, MemberActivity, MemberTotal,
    MonthCount, Reporter,
};
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

const TOP_MEMBERS: usize = 20;

#[derive(Debug, Serialize)]
pub struct ChannelSection {
    pub channel: ChannelRecord,
    pub total: i64,
    pub top_members: Vec<MemberTotal>,
}

/// Everything rendered for one guild; also written out as `data.json`.
#[derive(Debug, Serialize)]
pub struct GuildPage {
    pub guild: GuildRecord,
    pub daily: Vec<DatedCount>,
    pub monthly: Vec<MonthCount>,
    pub busiest_day: Option<DatedCount>,
    pub busiest_month: Option<MonthCount>,
    pub channels: Vec<ChannelSection>,
}

impl GuildPage {
    pub fn build(reporter: &Reporter, guild: GuildRecord) -> anyhow::Result<Self> {
        let daily = reporter.guild_daily_totals(guild.id)?;
        let monthly = monthly_rollup(&daily);
        let busiest_day = busiest_day(&daily).cloned();
        let busiest_month = busiest_month(&monthly).cloned();

        let mut channels = Vec::new();
        for channel in reporter.channels(guild.id)? {
            let total = reporter
                .channel_daily_series(channel.id)?
                .last()
                .map_or(0, |row| row.cumulative_count);
            let top_members = reporter.top_members(channel.id, TOP_MEMBERS)?;
            channels.push(ChannelSection {
                channel,
                total,
                top_members,
            });
        }

        Ok(Self {
            guild,
            daily,
            monthly,
            busiest_day,
            busiest_month,
            channels,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteSummary {
    pub guilds: usize,
    pub members: usize,
    pub files: usize,
}

pub fn write_site(reporter: &Reporter, out_dir: &Path) -> anyhow::Result<SiteSummary> {
    fs::create_dir_all(out_dir)?;
    let guilds = reporter.guilds()?;
    let mut summary = SiteSummary::default();

    for guild in &guilds {
        let page = GuildPage::build(reporter, guild.clone())?;
        let dir = out_dir.join(guild.id.to_string());
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("index.html"), render_guild(&page))?;
        fs::write(dir.join("data.json"), serde_json::to_string_pretty(&page)?)?;
        debug!("Wrote pages for {} ({})", guild.name, guild.id);
        summary.guilds += 1;
        summary.files += 2;
    }

    let members_dir = out_dir.join("members");
    for member_id in reporter.members()? {
        let activity = reporter.member_activity(member_id)?;
        fs::create_dir_all(&members_dir)?;
        fs::write(
            members_dir.join(format!("{}.html", member_id)),
            render_member(&activity, &guilds),
        )?;
        fs::write(
            members_dir.join(format!("{}.json", member_id)),
            serde_json::to_string_pretty(&activity)?,
        )?;
        summary.members += 1;
        summary.files += 2;
    }

    fs::write(out_dir.join("index.html"), render_index(&guilds))?;
    summary.files += 1;
    info!(
        "Wrote {} guild and {} member pages to {}",
        summary.guilds,
        summary.members,
        out_dir.display()
    );
    Ok(summary)
}

fn render_index(guilds: &[GuildRecord]) -> String {
    let mut html = page_head("Message statistics");
    html.push_str("<h1>Message statistics</h1>\n<ul>\n");
    for guild in guilds {
        html.push_str(&format!(
            "<li><a href=\"{}/index.html\">{}</a></li>\n",
            guild.id,
            escape_html(&guild.name)
        ));
    }
    html.push_str("</ul>\n</body>\n</html>\n");
    html
}

fn render_guild(page: &GuildPage) -> String {
    let name = escape_html(&page.guild.name);
    let mut html = page_head(&page.guild.name);
    html.push_str(&format!("<h1>{}</h1>\n", name));

    if let Some(day) = &page.busiest_day {
        html.push_str(&format!(
            "<p>Busiest day: {} with {} messages</p>\n",
            day.date, day.count
        ));
    }
    if let Some(month) = &page.busiest_month {
        html.push_str(&format!(
            "<p>Busiest month: {} with {} messages</p>\n",
            month.month, month.count
        ));
    }

    html.push_str("<h2>Monthly</h2>\n<table>\n<tr><th>Month</th><th>Messages</th></tr>\n");
    for month in &page.monthly {
        html.push_str(&format!(
            "<tr><td>{}</td><td>{}</td></tr>\n",
            month.month, month.count
        ));
    }
    html.push_str("</table>\n");

    for section in &page.channels {
        html.push_str(&format!(
            "<h2>#{} <small>{} messages</small></h2>\n<ol>\n",
            escape_html(&section.channel.name),
            section.total
        ));
        for member in &section.top_members {
            html.push_str(&format!(
                "<li><a href=\"../members/{}.html\">{}</a> ({})</li>\n",
                member.member_id,
                escape_html(&member.name),
                member.total
            ));
        }
        html.push_str("</ol>\n");
    }

    html.push_str("<p><a href=\"data.json\">Raw data</a></p>\n</body>\n</html>\n");
    html
}

fn render_member(activity: &MemberActivity, guilds: &[GuildRecord]) -> String {
    let title = activity
        .name
        .clone()
        .unwrap_or_else(|| format!("UNKNOWN ({})", activity.member_id));
    let mut html = page_head(&title);
    html.push_str(&format!("<h1>{}</h1>\n<ul>\n", escape_html(&title)));
    for guild_id in &activity.guilds {
        let name = guilds
            .iter()
            .find(|g| g.id == *guild_id)
            .map_or_else(|| guild_id.to_string(), |g| g.name.clone());
        html.push_str(&format!(
            "<li><a href=\"../{}/index.html\">{}</a></li>\n",
            guild_id,
            escape_html(&name)
        ));
    }
    html.push_str("</ul>\n");

    for channel in &activity.channels {
        let name = channel
            .channel_name
            .clone()
            .unwrap_or_else(|| channel.channel_id.to_string());
        html.push_str(&format!(
            "<h2>#{} <small>{} messages</small></h2>\n<table>\n<tr><th>Month</th><th>Messages</th></tr>\n",
            escape_html(&name),
            channel.total
        ));
        for month in &channel.monthly {
            html.push_str(&format!(
                "<tr><td>{}</td><td>{}</td></tr>\n",
                month.month, month.count
            ));
        }
        html.push_str("</table>\n");
    }

    html.push_str(&format!(
        "<p><a href=\"{}.json\">Raw data</a></p>\n</body>\n</html>\n",
        activity.member_id
    ));
    html
}

fn page_head(title: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n</head>\n<body>\n",
        escape_html(title)
    )
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
