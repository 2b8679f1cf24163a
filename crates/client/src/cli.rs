use anyhow::bail;
use huddle_protocol::{RoomId, UserId};
use uuid::Uuid;

pub(crate) struct Args {
    pub server_url: String,
    pub room: RoomId,
    pub user_id: UserId,
    pub nickname: String,
    pub screen_share: bool,
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let mut server_url = std::env::var("HUDDLE_SERVER_URL").unwrap_or_default();
    let mut room: Option<String> = None;
    let mut user_id: Option<String> = None;
    let mut nickname: Option<String> = None;
    let mut screen_share = false;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("huddle-client {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("huddle-client - headless Huddle mesh client");
                println!();
                println!("USAGE:");
                println!("    huddle-client --room <ROOM> [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    --server-url <URL>     Signaling server URL (or HUDDLE_SERVER_URL)");
                println!("    --room <ROOM>          Room to join (required)");
                println!("    --user-id <ID>         Stable user id [default: random UUID]");
                println!("    --nickname <NAME>      Display name [default: guest-<id prefix>]");
                println!("    --screen-share         Announce a screen-share stream instead of a camera");
                println!("    -h, --help             Print help");
                println!("    -V, --version          Print version");
                println!();
                println!("Chat: lines read from stdin are sent to the room.");
                std::process::exit(0);
            }
            "--server-url" => {
                if i + 1 < args.len() {
                    server_url = args[i + 1].clone();
                    i += 1;
                }
            }
            "--room" | "-r" => {
                if i + 1 < args.len() {
                    room = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--user-id" => {
                if i + 1 < args.len() {
                    user_id = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--nickname" | "-n" => {
                if i + 1 < args.len() {
                    nickname = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--screen-share" => {
                screen_share = true;
            }
            _ => {}
        }
        i += 1;
    }

    if server_url.is_empty() {
        bail!("--server-url or HUDDLE_SERVER_URL is required");
    }
    let Some(room) = room else {
        bail!("--room is required");
    };
    let user_id = user_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let nickname = nickname
        .unwrap_or_else(|| format!("guest-{}", user_id.chars().take(8).collect::<String>()));

    Ok(Args {
        server_url,
        room: RoomId::from(room),
        user_id: UserId::from(user_id),
        nickname,
        screen_share,
    })
}
