use logger;

macro_rules! expand_levels {
    ($($level:ident),+$(,)?) => {
        $(
            #[test]
            fn $level() {
                logger::$level!("Peer discovered.");
                logger::$level!("Peer {} discovered at {}:{}.", "a1b2c3", "192.168.1.20", 10000);
                logger::$level!("Group {group} joined.", group = "group_0123456789ab");
            }
        )*
    };
}

expand_levels!(trace, debug, info, warn, error,);
