//! Output rendering for the fogctl CLI.

use fog_core::{RepoRecord, Run, RunEvent, Session};

/// Print a list of sessions in tabular format.
pub fn print_session_list(sessions: &[Session]) {
    if sessions.is_empty() {
        println!("No sessions found.");
        return;
    }

    println!(
        "{:<36}  {:<24}  {:<28}  {:<8}  {:<10}",
        "ID", "REPO", "BRANCH", "TOOL", "STATUS"
    );
    println!("{}", "-".repeat(112));

    for session in sessions {
        println!(
            "{:<36}  {:<24}  {:<28}  {:<8}  {:<10}",
            session.id.0,
            truncate(&session.repo_name, 24),
            truncate(&session.branch, 28),
            session.tool.as_str(),
            session.status.as_str(),
        );
    }

    println!();
    println!("{} session(s)", sessions.len());
}

/// Print detailed information about a session and its runs.
pub fn print_session_details(session: &Session, runs: &[Run]) {
    println!("Session: {}", session.id);
    println!();
    println!("  Repo:     {}", session.repo_name);
    println!("  Branch:   {}", session.branch);
    println!("  Tool:     {}", session.tool.as_str());
    println!("  Status:   {}", session.status.as_str());
    println!("  Busy:     {}", session.busy);
    println!("  Auto-PR:  {}", session.autopr);
    if let Some(ref url) = session.pr_url {
        println!("  PR:       {url}");
    }
    if let Some(ref worktree) = session.worktree {
        println!("  Worktree: {worktree}");
    }
    println!("  Created:  {}", format_time(&session.created_at));

    if !runs.is_empty() {
        println!();
        println!("  Runs:");
        println!(
            "    {:<36}  {:<12}  {:<10}  {}",
            "ID", "STATE", "COMMIT", "PROMPT"
        );
        println!("    {}", "-".repeat(100));
        for run in runs {
            let sha = run
                .commit_sha
                .as_deref()
                .map(|s| s.chars().take(8).collect::<String>())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "    {:<36}  {:<12}  {:<10}  {}",
                run.id.0,
                run.state.as_str(),
                sha,
                truncate(&first_line(&run.prompt), 40),
            );
        }
    }
}

/// Print a list of registered repos.
pub fn print_repo_list(repos: &[RepoRecord]) {
    if repos.is_empty() {
        println!("No repos registered.");
        return;
    }

    println!("{:<30}  {:<16}  {}", "NAME", "DEFAULT BRANCH", "URL");
    println!("{}", "-".repeat(90));
    for repo in repos {
        println!(
            "{:<30}  {:<16}  {}",
            repo.name, repo.default_branch, repo.url
        );
    }
}

/// Print run events as a log tail.
pub fn print_events(events: &[RunEvent]) {
    for event in events {
        match event.event_type.as_str() {
            // Assistant chunks are already display text.
            "ai_chunk" => print!("{}", event.message),
            other => println!("\n[{}] {} {}", format_time(&event.ts), other, event.message),
        }
    }
    println!();
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or("").to_string()
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{head}...")
    }
}
