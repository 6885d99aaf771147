//! The builtin command table.
//!
//! Each command is a unit struct implementing [`CommandBody`]; the table
//! below wires names, arity, flags, ACL categories and key ranges together.
//! Embedders extend the table by appending their own specs before building
//! the registry.

use crate::client::Client;
use crate::command::{
    arg_int, arg_str, AclCategories as Acl, BlockCondition, BlockSpec, CommandBody, CommandFlags,
    CommandOutcome, CommandSpec, KeySpec, Reply,
};
use crate::exec::{reply, CallFlags};
use crate::propagate::PropTarget;
use crate::server::interfaces::Ttl;
use crate::server::{Role, Server};
use bytes::Bytes;
use std::sync::Arc;

/// Specs for every builtin command.
pub fn builtin_specs() -> Vec<CommandSpec> {
    vec![
        CommandSpec::new("ping", -1, Arc::new(Ping))
            .flags(
                CommandFlags::STALE_OK
                    | CommandFlags::LOADING_OK
                    | CommandFlags::ALLOW_BUSY
                    | CommandFlags::PUBSUB_OK,
            )
            .acl(Acl::FAST | Acl::CONNECTION),
        CommandSpec::new("echo", 2, Arc::new(Echo)).acl(Acl::FAST | Acl::CONNECTION),
        CommandSpec::new("auth", -2, Arc::new(Auth))
            .flags(
                CommandFlags::NO_AUTH
                    | CommandFlags::STALE_OK
                    | CommandFlags::LOADING_OK
                    | CommandFlags::ALLOW_BUSY
                    | CommandFlags::PUBSUB_OK
                    | CommandFlags::SKIP_MONITOR,
            )
            .acl(Acl::FAST | Acl::CONNECTION),
        CommandSpec::new("hello", -1, Arc::new(Hello))
            .flags(
                CommandFlags::NO_AUTH
                    | CommandFlags::STALE_OK
                    | CommandFlags::LOADING_OK
                    | CommandFlags::ALLOW_BUSY
                    | CommandFlags::PUBSUB_OK,
            )
            .acl(Acl::FAST | Acl::CONNECTION),
        CommandSpec::new("get", 2, Arc::new(Get))
            .flags(CommandFlags::READONLY)
            .acl(Acl::READ | Acl::FAST | Acl::KEYSPACE)
            .keys(KeySpec::single(1)),
        CommandSpec::new("set", -3, Arc::new(Set))
            .flags(CommandFlags::WRITE | CommandFlags::DENY_OOM)
            .acl(Acl::WRITE | Acl::SLOW | Acl::KEYSPACE)
            .keys(KeySpec::single(1)),
        CommandSpec::new("del", -2, Arc::new(Del))
            .flags(CommandFlags::WRITE)
            .acl(Acl::WRITE | Acl::SLOW | Acl::KEYSPACE)
            .keys(KeySpec::trailing(1)),
        CommandSpec::new("expire", 3, Arc::new(Expire))
            .flags(CommandFlags::WRITE | CommandFlags::DENY_OOM)
            .acl(Acl::WRITE | Acl::FAST | Acl::KEYSPACE)
            .keys(KeySpec::single(1)),
        CommandSpec::new("ttl", 2, Arc::new(TtlCmd))
            .flags(CommandFlags::READONLY)
            .acl(Acl::READ | Acl::FAST | Acl::KEYSPACE)
            .keys(KeySpec::single(1)),
        CommandSpec::new("flushall", -1, Arc::new(FlushAll))
            .flags(CommandFlags::WRITE | CommandFlags::ARBITRARY_KEYS)
            .acl(Acl::WRITE | Acl::SLOW | Acl::DANGEROUS),
        CommandSpec::new("multi", 1, Arc::new(Multi))
            .flags(
                CommandFlags::MULTI_CONTROL
                    | CommandFlags::LOADING_OK
                    | CommandFlags::STALE_OK
                    | CommandFlags::ALLOW_BUSY,
            )
            .acl(Acl::FAST | Acl::TRANSACTION),
        CommandSpec::new("exec", 1, Arc::new(Exec))
            .flags(CommandFlags::MULTI_CONTROL | CommandFlags::SKIP_MONITOR)
            .acl(Acl::SLOW | Acl::TRANSACTION),
        CommandSpec::new("discard", 1, Arc::new(Discard))
            .flags(
                CommandFlags::MULTI_CONTROL
                    | CommandFlags::LOADING_OK
                    | CommandFlags::STALE_OK
                    | CommandFlags::ALLOW_BUSY,
            )
            .acl(Acl::FAST | Acl::TRANSACTION),
        CommandSpec::new("reset", 1, Arc::new(Reset))
            .flags(
                CommandFlags::MULTI_CONTROL
                    | CommandFlags::NO_AUTH
                    | CommandFlags::STALE_OK
                    | CommandFlags::LOADING_OK
                    | CommandFlags::ALLOW_BUSY
                    | CommandFlags::PUBSUB_OK
                    | CommandFlags::SKIP_MONITOR,
            )
            .acl(Acl::FAST | Acl::CONNECTION),
        CommandSpec::new("subscribe", -2, Arc::new(Subscribe))
            .flags(
                CommandFlags::PUBSUB_OK
                    | CommandFlags::NO_MULTI
                    | CommandFlags::LOADING_OK
                    | CommandFlags::STALE_OK,
            )
            .acl(Acl::PUBSUB | Acl::FAST),
        CommandSpec::new("unsubscribe", -1, Arc::new(Unsubscribe))
            .flags(
                CommandFlags::PUBSUB_OK
                    | CommandFlags::NO_MULTI
                    | CommandFlags::LOADING_OK
                    | CommandFlags::STALE_OK,
            )
            .acl(Acl::PUBSUB | Acl::FAST),
        CommandSpec::new("wait", 3, Arc::new(Wait)).acl(Acl::SLOW | Acl::BLOCKING),
        CommandSpec::new("shutdown", -1, Arc::new(Shutdown))
            .flags(
                CommandFlags::ADMIN
                    | CommandFlags::PROTECTED
                    | CommandFlags::LOADING_OK
                    | CommandFlags::STALE_OK
                    | CommandFlags::NO_MULTI,
            )
            .acl(Acl::ADMIN | Acl::DANGEROUS),
        CommandSpec::new("replicaof", 3, Arc::new(ReplicaOf))
            .flags(
                CommandFlags::ADMIN
                    | CommandFlags::PROTECTED
                    | CommandFlags::STALE_OK
                    | CommandFlags::NO_ASYNC_LOADING,
            )
            .acl(Acl::ADMIN | Acl::DANGEROUS),
        CommandSpec::container("config", -2)
            .sub(
                CommandSpec::new("get", -3, Arc::new(ConfigGet))
                    .flags(CommandFlags::ADMIN | CommandFlags::LOADING_OK | CommandFlags::STALE_OK)
                    .acl(Acl::ADMIN | Acl::SLOW),
            )
            .sub(
                CommandSpec::new("set", -4, Arc::new(ConfigSet))
                    .flags(CommandFlags::ADMIN | CommandFlags::PROTECTED)
                    .acl(Acl::ADMIN | Acl::SLOW | Acl::DANGEROUS),
            )
            .sub(
                CommandSpec::new("resetstat", 2, Arc::new(ConfigResetStat))
                    .flags(CommandFlags::ADMIN)
                    .acl(Acl::ADMIN | Acl::SLOW),
            ),
        CommandSpec::container("client", -2)
            .sub(
                CommandSpec::new("id", 2, Arc::new(ClientId))
                    .flags(CommandFlags::LOADING_OK | CommandFlags::STALE_OK)
                    .acl(Acl::FAST | Acl::CONNECTION),
            )
            .sub(
                CommandSpec::new("getname", 2, Arc::new(ClientGetName))
                    .flags(CommandFlags::LOADING_OK | CommandFlags::STALE_OK)
                    .acl(Acl::FAST | Acl::CONNECTION),
            )
            .sub(
                CommandSpec::new("setname", 3, Arc::new(ClientSetName))
                    .flags(CommandFlags::LOADING_OK | CommandFlags::STALE_OK)
                    .acl(Acl::FAST | Acl::CONNECTION),
            )
            .sub(
                CommandSpec::new("list", -2, Arc::new(ClientList))
                    .flags(CommandFlags::ADMIN | CommandFlags::LOADING_OK | CommandFlags::STALE_OK)
                    .acl(Acl::ADMIN | Acl::SLOW | Acl::CONNECTION),
            ),
        CommandSpec::container("command", -1)
            .bare_body(Arc::new(CommandBare))
            .sub(
                CommandSpec::new("count", 2, Arc::new(CommandCount))
                    .flags(CommandFlags::LOADING_OK | CommandFlags::STALE_OK)
                    .acl(Acl::SLOW | Acl::CONNECTION),
            )
            .sub(
                CommandSpec::new("info", -2, Arc::new(CommandInfo))
                    .flags(CommandFlags::LOADING_OK | CommandFlags::STALE_OK)
                    .acl(Acl::SLOW | Acl::CONNECTION),
            )
            .flags(CommandFlags::LOADING_OK | CommandFlags::STALE_OK)
            .acl(Acl::SLOW | Acl::CONNECTION),
    ]
}

fn args(client: &Client) -> Vec<Bytes> {
    client
        .resolved
        .as_ref()
        .map(|r| r.argv.clone())
        .unwrap_or_default()
}

fn wrong_arity(name: &str) -> CommandOutcome {
    reply(Reply::error(
        "ERR",
        format!("wrong number of arguments for '{name}' command"),
    ))
}

struct Ping;

impl CommandBody for Ping {
    fn invoke(&self, _srv: &mut Server, client: &mut Client) -> CommandOutcome {
        let argv = args(client);
        match argv.len() {
            1 => reply(Reply::simple("PONG")),
            2 => reply(Reply::Bulk(argv[1].clone())),
            _ => wrong_arity("ping"),
        }
    }
}

struct Echo;

impl CommandBody for Echo {
    fn invoke(&self, _srv: &mut Server, client: &mut Client) -> CommandOutcome {
        let argv = args(client);
        reply(Reply::Bulk(argv[1].clone()))
    }
}

struct Auth;

impl CommandBody for Auth {
    fn invoke(&self, srv: &mut Server, client: &mut Client) -> CommandOutcome {
        let argv = args(client);
        if argv.len() > 3 {
            return wrong_arity("auth");
        }
        let Some(expected) = srv.config.server.password.as_deref() else {
            return reply(Reply::err(
                "Client sent AUTH, but no password is set",
            ));
        };
        let given = argv.last().map(|b| b.as_ref());
        if given == Some(expected.as_bytes()) {
            client.authenticated = true;
            reply(Reply::Ok)
        } else {
            reply(Reply::error("WRONGPASS", "invalid password"))
        }
    }
}

struct Hello;

impl CommandBody for Hello {
    fn invoke(&self, _srv: &mut Server, client: &mut Client) -> CommandOutcome {
        let argv = args(client);
        if argv.len() > 2 {
            return wrong_arity("hello");
        }
        if argv.len() == 2 {
            match arg_int(&argv, 1) {
                Some(2) => client.resp3 = false,
                Some(3) => client.resp3 = true,
                _ => {
                    return reply(Reply::error(
                        "NOPROTO",
                        "unsupported protocol version",
                    ))
                }
            }
        }
        let proto = if client.resp3 { 3 } else { 2 };
        reply(Reply::Array(vec![
            Reply::bulk(&b"proto"[..]),
            Reply::Int(proto),
            Reply::bulk(&b"id"[..]),
            Reply::Int(client.id as i64),
        ]))
    }
}

struct Get;

impl CommandBody for Get {
    fn invoke(&self, srv: &mut Server, client: &mut Client) -> CommandOutcome {
        let argv = args(client);
        let now = srv.clock().cached_ms();
        match srv.dataset.get(client.db as usize, &argv[1], now) {
            Some(value) => reply(Reply::Bulk(value)),
            None => reply(Reply::Null),
        }
    }
}

struct Set;

impl CommandBody for Set {
    fn invoke(&self, srv: &mut Server, client: &mut Client) -> CommandOutcome {
        let argv = args(client);
        let now = srv.clock().cached_ms();
        let key = argv[1].clone();
        let value = argv[2].clone();

        let mut expire_at: Option<u64> = None;
        let mut relative_expiry = false;
        let mut keep_ttl = false;
        let mut if_absent = false;
        let mut if_present = false;
        let mut want_old = false;

        let mut i = 3;
        while i < argv.len() {
            let Some(opt) = arg_str(&argv, i) else {
                return reply(Reply::err("syntax error"));
            };
            match opt.to_ascii_uppercase().as_str() {
                "NX" => if_absent = true,
                "XX" => if_present = true,
                "GET" => want_old = true,
                "KEEPTTL" => keep_ttl = true,
                "EX" | "PX" | "EXAT" | "PXAT" => {
                    let Some(raw) = arg_int(&argv, i + 1) else {
                        return reply(Reply::err("syntax error"));
                    };
                    if raw <= 0 && (opt.eq_ignore_ascii_case("EX") || opt.eq_ignore_ascii_case("PX"))
                    {
                        return reply(Reply::err("invalid expire time in 'set' command"));
                    }
                    let at = match opt.to_ascii_uppercase().as_str() {
                        "EX" => {
                            relative_expiry = true;
                            now + raw as u64 * 1000
                        }
                        "PX" => {
                            relative_expiry = true;
                            now + raw as u64
                        }
                        "EXAT" => raw.max(0) as u64 * 1000,
                        _ => raw.max(0) as u64,
                    };
                    expire_at = Some(at);
                    i += 1;
                }
                _ => return reply(Reply::err("syntax error")),
            }
            i += 1;
        }
        if if_absent && if_present {
            return reply(Reply::err("syntax error"));
        }

        let db = client.db as usize;
        let old = srv.dataset.get(db, &key, now);
        if (if_absent && old.is_some()) || (if_present && old.is_none()) {
            return reply(if want_old {
                old.map(Reply::Bulk).unwrap_or(Reply::Null)
            } else {
                Reply::Null
            });
        }

        if keep_ttl && expire_at.is_none() {
            if let Ttl::Remaining(rem) = srv.dataset.ttl(db, &key, now) {
                expire_at = Some(now + rem);
            }
        }
        srv.dataset.set(db, key.clone(), value.clone(), expire_at);

        // Relative expirations replicate as an absolute deadline so replay
        // at a later instant lands on the same expiry.
        if relative_expiry {
            if let Some(at) = expire_at {
                client.rewrite_args(vec![
                    argv[0].clone(),
                    key,
                    value,
                    Bytes::from_static(b"PXAT"),
                    Bytes::from(at.to_string()),
                ]);
            }
        }

        reply(if want_old {
            old.map(Reply::Bulk).unwrap_or(Reply::Null)
        } else {
            Reply::Ok
        })
    }
}

struct Del;

impl CommandBody for Del {
    fn invoke(&self, srv: &mut Server, client: &mut Client) -> CommandOutcome {
        let argv = args(client);
        let db = client.db as usize;
        let mut removed = 0;
        for key in &argv[1..] {
            if srv.dataset.del(db, key) {
                removed += 1;
            }
        }
        reply(Reply::Int(removed))
    }
}

struct Expire;

impl CommandBody for Expire {
    fn invoke(&self, srv: &mut Server, client: &mut Client) -> CommandOutcome {
        let argv = args(client);
        let Some(secs) = arg_int(&argv, 2) else {
            return reply(Reply::not_an_integer());
        };
        let db = client.db as usize;
        let now = srv.clock().cached_ms();
        let applied = if secs <= 0 {
            srv.dataset.del(db, &argv[1])
        } else {
            srv.dataset.expire(db, &argv[1], now + secs as u64 * 1000)
        };
        reply(Reply::Int(applied as i64))
    }
}

struct TtlCmd;

impl CommandBody for TtlCmd {
    fn invoke(&self, srv: &mut Server, client: &mut Client) -> CommandOutcome {
        let argv = args(client);
        let now = srv.clock().cached_ms();
        let value = match srv.dataset.ttl(client.db as usize, &argv[1], now) {
            Ttl::Missing => -2,
            Ttl::Persistent => -1,
            Ttl::Remaining(ms) => ms.div_ceil(1000) as i64,
        };
        reply(Reply::Int(value))
    }
}

struct FlushAll;

impl CommandBody for FlushAll {
    fn invoke(&self, srv: &mut Server, _client: &mut Client) -> CommandOutcome {
        let removed = srv.dataset.flush_all();
        tracing::info!(removed, "dataset flushed");
        reply(Reply::Ok)
    }
}

struct Multi;

impl CommandBody for Multi {
    fn invoke(&self, _srv: &mut Server, client: &mut Client) -> CommandOutcome {
        if client.in_multi() {
            return reply(Reply::err("MULTI calls can not be nested"));
        }
        client.multi = Some(Default::default());
        reply(Reply::Ok)
    }
}

struct Exec;

impl CommandBody for Exec {
    fn invoke(&self, srv: &mut Server, client: &mut Client) -> CommandOutcome {
        let Some(multi) = client.multi.take() else {
            return reply(Reply::err("EXEC without MULTI"));
        };
        if multi.poisoned {
            return reply(Reply::error(
                "EXECABORT",
                "Transaction discarded because of previous errors",
            ));
        }

        let own_resolved = client.resolved.take();
        let mut replies = Vec::with_capacity(multi.queued.len());
        for queued in multi.queued {
            client.resolved = Some(queued);
            match srv.call(client, CallFlags::FULL) {
                CommandOutcome::Reply(r) => replies.push(r),
                CommandOutcome::Blocked(_) => {
                    client.blocked = None;
                    replies.push(Reply::err("command may not block inside a transaction"));
                }
            }
        }
        client.resolved = own_resolved;

        // The queued commands staged their own propagation; EXEC itself
        // must not stage a duplicate.
        client.prop.suppress = PropTarget::BOTH;
        reply(Reply::Array(replies))
    }
}

struct Discard;

impl CommandBody for Discard {
    fn invoke(&self, _srv: &mut Server, client: &mut Client) -> CommandOutcome {
        if client.multi.take().is_none() {
            return reply(Reply::err("DISCARD without MULTI"));
        }
        reply(Reply::Ok)
    }
}

struct Reset;

impl CommandBody for Reset {
    fn invoke(&self, _srv: &mut Server, client: &mut Client) -> CommandOutcome {
        client.multi = None;
        client.subscribed_channels = 0;
        client.authenticated = false;
        client.name = None;
        reply(Reply::simple("RESET"))
    }
}

struct Subscribe;

impl CommandBody for Subscribe {
    fn invoke(&self, _srv: &mut Server, client: &mut Client) -> CommandOutcome {
        let argv = args(client);
        let mut entries = Vec::with_capacity(argv.len() - 1);
        for channel in &argv[1..] {
            client.subscribed_channels += 1;
            entries.push(Reply::Array(vec![
                Reply::bulk(&b"subscribe"[..]),
                Reply::Bulk(channel.clone()),
                Reply::Int(client.subscribed_channels as i64),
            ]));
        }
        reply(Reply::Array(entries))
    }
}

struct Unsubscribe;

impl CommandBody for Unsubscribe {
    fn invoke(&self, _srv: &mut Server, client: &mut Client) -> CommandOutcome {
        let argv = args(client);
        if argv.len() == 1 {
            client.subscribed_channels = 0;
        } else {
            let n = (argv.len() - 1).min(client.subscribed_channels);
            client.subscribed_channels -= n;
        }
        reply(Reply::Int(client.subscribed_channels as i64))
    }
}

struct Wait;

impl CommandBody for Wait {
    fn invoke(&self, srv: &mut Server, client: &mut Client) -> CommandOutcome {
        let argv = args(client);
        let needed = match arg_int(&argv, 1) {
            Some(n) if n >= 0 => n as usize,
            _ => return reply(Reply::not_an_integer()),
        };
        let timeout_ms = match arg_int(&argv, 2) {
            Some(t) if t >= 0 => t as u64,
            _ => return reply(Reply::not_an_integer()),
        };

        let offset = srv.replicas.stream_offset();
        let acked = srv.replicas.acked_count(offset);
        if client.block_timed_out {
            client.block_timed_out = false;
            return reply(Reply::Int(acked as i64));
        }
        // Blocking is a top-level outcome only; nested invocations answer
        // with the instantaneous count.
        if acked >= needed || srv.exec.depth() > 1 {
            return reply(Reply::Int(acked as i64));
        }
        let deadline_ms = (timeout_ms > 0).then(|| srv.clock().cached_ms() + timeout_ms);
        CommandOutcome::Blocked(BlockSpec {
            condition: BlockCondition::ReplicaAck {
                offset,
                count: needed,
            },
            deadline_ms,
        })
    }
}

struct Shutdown;

impl CommandBody for Shutdown {
    fn invoke(&self, srv: &mut Server, _client: &mut Client) -> CommandOutcome {
        // Sequencing happens on the maintenance cron; here we only raise
        // the same flag a signal handler would.
        srv.shutdown.handle().request();
        tracing::info!("shutdown requested by command");
        reply(Reply::Ok)
    }
}

struct ReplicaOf;

impl CommandBody for ReplicaOf {
    fn invoke(&self, srv: &mut Server, client: &mut Client) -> CommandOutcome {
        let argv = args(client);
        let (Some(host), Some(port)) = (arg_str(&argv, 1), arg_str(&argv, 2)) else {
            return reply(Reply::err("syntax error"));
        };
        if host.eq_ignore_ascii_case("no") && port.eq_ignore_ascii_case("one") {
            if srv.role.is_replica() {
                tracing::info!("promoting to primary");
            }
            srv.role = Role::Primary;
            return reply(Reply::Ok);
        }
        if port.parse::<u16>().is_err() {
            return reply(Reply::err("Invalid master port"));
        }
        tracing::info!(upstream = %format!("{host}:{port}"), "demoting to replica");
        srv.role = Role::Replica { link_up: false };
        reply(Reply::Ok)
    }
}

struct ConfigGet;

impl CommandBody for ConfigGet {
    fn invoke(&self, srv: &mut Server, client: &mut Client) -> CommandOutcome {
        let argv = args(client);
        let mut pairs = Vec::new();
        for pattern in &argv[2..] {
            let Some(pattern) = std::str::from_utf8(pattern).ok() else {
                continue;
            };
            for (name, value) in config_entries(srv) {
                let matched = pattern == "*" || pattern.eq_ignore_ascii_case(name);
                if matched && !pairs.iter().any(|(n, _)| *n == name) {
                    pairs.push((name, value));
                }
            }
        }
        let mut entries = Vec::with_capacity(pairs.len() * 2);
        for (name, value) in pairs {
            entries.push(Reply::bulk(name.as_bytes().to_vec()));
            entries.push(Reply::bulk(value.into_bytes()));
        }
        reply(Reply::Array(entries))
    }
}

fn config_entries(srv: &Server) -> Vec<(&'static str, String)> {
    vec![
        ("maxmemory", srv.config.memory.max_bytes.to_string()),
        ("hz", srv.config.server.hz.to_string()),
        (
            "min-replicas-to-write",
            srv.config.replication.min_replicas_to_write.to_string(),
        ),
        ("timeout", srv.config.clients.timeout_secs.to_string()),
    ]
}

struct ConfigSet;

impl CommandBody for ConfigSet {
    fn invoke(&self, srv: &mut Server, client: &mut Client) -> CommandOutcome {
        let argv = args(client);
        if (argv.len() - 2) % 2 != 0 {
            return wrong_arity("config|set");
        }
        let mut i = 2;
        while i < argv.len() {
            let (Some(name), Some(value)) = (arg_str(&argv, i), arg_str(&argv, i + 1)) else {
                return reply(Reply::err("syntax error"));
            };
            match name.to_ascii_lowercase().as_str() {
                "maxmemory" => match value.parse() {
                    Ok(v) => srv.config.memory.max_bytes = v,
                    Err(_) => return reply(Reply::not_an_integer()),
                },
                "hz" => match value.parse() {
                    Ok(v) if (crate::core::config::HZ_MIN..=crate::core::config::HZ_MAX)
                        .contains(&v) =>
                    {
                        srv.config.server.hz = v;
                    }
                    _ => {
                        return reply(Reply::err(format!(
                            "argument couldn't be parsed into an integer in range for 'hz': {value}"
                        )))
                    }
                },
                "min-replicas-to-write" => match value.parse() {
                    Ok(v) => srv.config.replication.min_replicas_to_write = v,
                    Err(_) => return reply(Reply::not_an_integer()),
                },
                "timeout" => match value.parse() {
                    Ok(v) => srv.config.clients.timeout_secs = v,
                    Err(_) => return reply(Reply::not_an_integer()),
                },
                other => {
                    return reply(Reply::err(format!(
                        "Unknown option or number of arguments for CONFIG SET - '{other}'"
                    )))
                }
            }
            i += 2;
        }
        reply(Reply::Ok)
    }
}

struct ConfigResetStat;

impl CommandBody for ConfigResetStat {
    fn invoke(&self, srv: &mut Server, _client: &mut Client) -> CommandOutcome {
        for desc in srv.registry.iter() {
            desc.stats.reset();
            if let Some(subs) = desc.subcommands.as_ref() {
                for sub in subs {
                    sub.stats.reset();
                }
            }
        }
        srv.stats.commands_processed = 0;
        reply(Reply::Ok)
    }
}

struct ClientId;

impl CommandBody for ClientId {
    fn invoke(&self, _srv: &mut Server, client: &mut Client) -> CommandOutcome {
        reply(Reply::Int(client.id as i64))
    }
}

struct ClientGetName;

impl CommandBody for ClientGetName {
    fn invoke(&self, _srv: &mut Server, client: &mut Client) -> CommandOutcome {
        match client.name.as_ref() {
            Some(name) => reply(Reply::bulk(name.clone().into_bytes())),
            None => reply(Reply::Null),
        }
    }
}

struct ClientSetName;

impl CommandBody for ClientSetName {
    fn invoke(&self, _srv: &mut Server, client: &mut Client) -> CommandOutcome {
        let argv = args(client);
        let Some(name) = arg_str(&argv, 2) else {
            return reply(Reply::err("Client names cannot contain binary data"));
        };
        if name.contains([' ', '\n', '\r']) {
            return reply(Reply::err(
                "Client names cannot contain spaces, newlines or special characters",
            ));
        }
        client.name = Some(name.to_string());
        reply(Reply::Ok)
    }
}

struct ClientList;

impl CommandBody for ClientList {
    fn invoke(&self, srv: &mut Server, client: &mut Client) -> CommandOutcome {
        let mut lines = String::new();
        let mut describe = |c: &Client| {
            lines.push_str(&format!(
                "id={} name={} db={} multi={} sub={}\n",
                c.id,
                c.name.as_deref().unwrap_or(""),
                c.db,
                c.multi.as_ref().map_or(0, |m| m.queued.len()),
                c.subscribed_channels,
            ));
        };
        describe(client);
        for other in srv.clients.iter() {
            describe(other);
        }
        reply(Reply::bulk(lines.into_bytes()))
    }
}

struct CommandBare;

impl CommandBody for CommandBare {
    fn invoke(&self, srv: &mut Server, _client: &mut Client) -> CommandOutcome {
        let mut names: Vec<&str> = srv.registry.iter().map(|d| d.name.as_str()).collect();
        names.sort_unstable();
        let entries = names
            .into_iter()
            .map(|n| Reply::bulk(n.as_bytes().to_vec()))
            .collect();
        reply(Reply::Array(entries))
    }
}

struct CommandCount;

impl CommandBody for CommandCount {
    fn invoke(&self, srv: &mut Server, _client: &mut Client) -> CommandOutcome {
        reply(Reply::Int(srv.registry.len() as i64))
    }
}

struct CommandInfo;

impl CommandBody for CommandInfo {
    fn invoke(&self, srv: &mut Server, client: &mut Client) -> CommandOutcome {
        let argv = args(client);
        let mut entries = Vec::with_capacity(argv.len() - 2);
        for name in &argv[2..] {
            let Some(name) = std::str::from_utf8(name).ok() else {
                entries.push(Reply::Null);
                continue;
            };
            match srv.registry.lookup(name) {
                Some(desc) => entries.push(Reply::Array(vec![
                    Reply::bulk(desc.name.clone().into_bytes()),
                    Reply::Int(desc.arity as i64),
                    Reply::Int(desc.keys.first as i64),
                    Reply::Int(desc.keys.last as i64),
                    Reply::Int(desc.keys.step as i64),
                ])),
                None => entries.push(Reply::Null),
            }
        }
        reply(Reply::Array(entries))
    }
}
